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

use crate::id::ExtId;

/// The view this crate needs of an extension issuing syscalls.
///
/// Loading, trust and ABI marshaling of extensions live elsewhere; the
/// dispatcher only asks who the caller is and whether its handle is open.
pub trait AxExtension {
    /// The identity of the extension, unique among loaded extensions.
    fn id(&self) -> ExtId;

    /// Whether `hndl` is the handle the extension obtained when it opened the syscall interface.
    fn is_handle_valid(&self, hndl: u64) -> bool;
}
