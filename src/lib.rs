// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVmk - VM/VP/VS lifecycle core for ArceOS-style type-1 hypervisors.
//!
//! This crate is the control plane of a hypervisor microkernel. It tracks
//! the virtual machines (VMs), virtual processors (VPs) and virtual CPU
//! states (VSs) that make up guests, keeps their cross-core state machine
//! consistent, and validates every syscall issued by extensions before any
//! hardware primitive is touched. Hardware access is delegated to an
//! implementation of the `AxArchVs` trait.
//!
//! # Features
//!
//! - Fixed-capacity VM, VP and VS pools with per-slot locking
//! - Ownership chain VM → VP → VS checked on every activation
//! - Atomic switch of a core's active VM/VP/VS triple with hardware rollback
//! - Syscall decoding and dispatch with stable status codes
//! - VMCS field names and object dumps for debugging

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod arch_vs; // Architecture-specific VS trait definition
mod config; // Pool capacities
pub mod debug; // VMCS field names and debug output
mod dispatch; // Syscall dispatcher
mod error; // Error taxonomy and status codes
mod ext; // Extension seam
mod id; // Object identifiers
mod percpu; // Per-core execution context
mod reg; // VS register selectors
mod slot; // Lock-guarded slot tables
pub mod syscall; // Opcode decoding
mod test; // Unit tests
mod vm; // VM pool
mod vp; // VP pool
mod vs; // VS pool and active-triple switch

// Public API exports
pub use arch_vs::AxArchVs;
pub use config::*;
pub use dispatch::dispatch_syscall;
pub use error::{MkError, MkResult, status};
pub use ext::AxExtension;
pub use id::*;
pub use percpu::{ActiveTriple, PerCpuCtx};
pub use reg::{VS_REG_MAX, VsReg};
pub use vm::VmPool;
pub use vp::VpPool;
pub use vs::{TLB_FLUSH_ALL, VsPool};
