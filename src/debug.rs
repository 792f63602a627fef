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

//! Diagnostics: VMCS field names and the `debug_op_out` sink.
//!
//! Object dumps live with their pools (`VmPool::dump` and friends).

/// The name printed for encodings missing from the table.
pub const UNDEFINED_VMCS_FIELD: &str = "UNDEFINED_VMCS_FIELD";

/// Known VMCS field encodings and their names, sorted by encoding.
static VMCS_FIELDS: &[(u64, &str)] = &[
    (0x0000, "VMCS_VIRTUAL_PROCESSOR_IDENTIFIER"),
    (0x0002, "VMCS_POSTED_INTERRUPT_NOTIFICATION_VECTOR"),
    (0x0004, "VMCS_EPTP_INDEX"),
    (0x0800, "VMCS_GUEST_ES_SELECTOR"),
    (0x0802, "VMCS_GUEST_CS_SELECTOR"),
    (0x0804, "VMCS_GUEST_SS_SELECTOR"),
    (0x0806, "VMCS_GUEST_DS_SELECTOR"),
    (0x0808, "VMCS_GUEST_FS_SELECTOR"),
    (0x080A, "VMCS_GUEST_GS_SELECTOR"),
    (0x080C, "VMCS_GUEST_LDTR_SELECTOR"),
    (0x080E, "VMCS_GUEST_TR_SELECTOR"),
    (0x0810, "VMCS_GUEST_INTERRUPT_STATUS"),
    (0x0812, "VMCS_PML_INDEX"),
    (0x0C00, "VMCS_HOST_ES_SELECTOR"),
    (0x0C02, "VMCS_HOST_CS_SELECTOR"),
    (0x0C04, "VMCS_HOST_SS_SELECTOR"),
    (0x0C06, "VMCS_HOST_DS_SELECTOR"),
    (0x0C08, "VMCS_HOST_FS_SELECTOR"),
    (0x0C0A, "VMCS_HOST_GS_SELECTOR"),
    (0x0C0C, "VMCS_HOST_TR_SELECTOR"),
    (0x2000, "VMCS_ADDRESS_OF_IO_BITMAP_A"),
    (0x2002, "VMCS_ADDRESS_OF_IO_BITMAP_B"),
    (0x2004, "VMCS_ADDRESS_OF_MSR_BITMAPS"),
    (0x2006, "VMCS_VMEXIT_MSR_STORE_ADDRESS"),
    (0x2008, "VMCS_VMEXIT_MSR_LOAD_ADDRESS"),
    (0x200A, "VMCS_VMENTRY_MSR_LOAD_ADDRESS"),
    (0x200C, "VMCS_EXECUTIVE_VMCS_POINTER"),
    (0x200E, "VMCS_PML_ADDRESS"),
    (0x2010, "VMCS_TSC_OFFSET"),
    (0x2012, "VMCS_VIRTUAL_APIC_ADDRESS"),
    (0x2014, "VMCS_APIC_ACCESS_ADDRESS"),
    (0x2016, "VMCS_POSTED_INTERRUPT_DESCRIPTOR_ADDRESS"),
    (0x2018, "VMCS_VM_FUNCTION_CONTROLS"),
    (0x201A, "VMCS_EPT_POINTER"),
    (0x201C, "VMCS_EOI_EXIT_BITMAP0"),
    (0x201E, "VMCS_EOI_EXIT_BITMAP1"),
    (0x2020, "VMCS_EOI_EXIT_BITMAP2"),
    (0x2022, "VMCS_EOI_EXIT_BITMAP3"),
    (0x2024, "VMCS_EPTP_LIST_ADDRESS"),
    (0x2026, "VMCS_VMREAD_BITMAP_ADDRESS"),
    (0x2028, "VMCS_VMWRITE_BITMAP_ADDRESS"),
    (0x202A, "VMCS_VIRT_EXCEPTION_INFORMATION_ADDRESS"),
    (0x202C, "VMCS_XSS_EXITING_BITMAP"),
    (0x202E, "VMCS_ENCLS_EXITING_BITMAP"),
    (0x2030, "VMCS_SUB_PAGE_PERMISSION_TABLE_POINTER"),
    (0x2032, "VMCS_TLS_MULTIPLIER"),
    (0x2400, "VMCS_GUEST_PHYSICAL_ADDRESS"),
    (0x2800, "VMCS_VMCS_LINK_POINTER"),
    (0x2802, "VMCS_GUEST_IA32_DEBUGCTL"),
    (0x2804, "VMCS_GUEST_IA32_PAT"),
    (0x2806, "VMCS_GUEST_IA32_EFER"),
    (0x2808, "VMCS_GUEST_IA32_PERF_GLOBAL_CTRL"),
    (0x280A, "VMCS_GUEST_PDPTE0"),
    (0x280C, "VMCS_GUEST_PDPTE1"),
    (0x280E, "VMCS_GUEST_PDPTE2"),
    (0x2810, "VMCS_GUEST_PDPTE3"),
    (0x2812, "VMCS_GUEST_IA32_BNDCFGS"),
    (0x2814, "VMCS_GUEST_RTIT_CTL"),
    (0x2C00, "VMCS_HOST_IA32_PAT"),
    (0x2C02, "VMCS_HOST_IA32_EFER"),
    (0x2C04, "VMCS_HOST_IA32_PERF_GLOBAL_CTRL"),
    (0x4000, "VMCS_PIN_BASED_VM_EXECUTION_CTLS"),
    (0x4002, "VMCS_PRIMARY_PROC_BASED_VM_EXECUTION_CTLS"),
    (0x4004, "VMCS_EXCEPTION_BITMAP"),
    (0x4006, "VMCS_PAGE_FAULT_ERROR_CODE_MASK"),
    (0x4008, "VMCS_PAGE_FAULT_ERROR_CODE_MATCH"),
    (0x400A, "VMCS_CR3_TARGET_COUNT"),
    (0x400C, "VMCS_VMEXIT_CTLS"),
    (0x400E, "VMCS_VMEXIT_MSR_STORE_COUNT"),
    (0x4010, "VMCS_VMEXIT_MSR_LOAD_COUNT"),
    (0x4012, "VMCS_VMENTRY_CTLS"),
    (0x4014, "VMCS_VMENTRY_MSR_LOAD_COUNT"),
    (0x4016, "VMCS_VMENTRY_INTERRUPT_INFORMATION_FIELD"),
    (0x4018, "VMCS_VMENTRY_EXCEPTION_ERROR_CODE"),
    (0x401A, "VMCS_VMENTRY_INSTRUCTION_LENGTH"),
    (0x401C, "VMCS_TPR_THRESHOLD"),
    (0x401E, "VMCS_SECONDARY_PROC_BASED_VM_EXECUTION_CTLS"),
    (0x4020, "VMCS_PLE_GAP"),
    (0x4022, "VMCS_PLE_WINDOW"),
    (0x4400, "VMCS_VM_INSTRUCTION_ERROR"),
    (0x4402, "VMCS_EXIT_REASON"),
    (0x4404, "VMCS_VMEXIT_INTERRUPTION_INFORMATION"),
    (0x4406, "VMCS_VMEXIT_INTERRUPTION_ERROR_CODE"),
    (0x4408, "VMCS_IDT_VECTORING_INFORMATION_FIELD"),
    (0x440A, "VMCS_IDT_VECTORING_ERROR_CODE"),
    (0x440C, "VMCS_VMEXIT_INSTRUCTION_LENGTH"),
    (0x440E, "VMCS_VMEXIT_INSTRUCTION_INFORMATION"),
    (0x4800, "VMCS_GUEST_ES_LIMIT"),
    (0x4802, "VMCS_GUEST_CS_LIMIT"),
    (0x4804, "VMCS_GUEST_SS_LIMIT"),
    (0x4806, "VMCS_GUEST_DS_LIMIT"),
    (0x4808, "VMCS_GUEST_FS_LIMIT"),
    (0x480A, "VMCS_GUEST_GS_LIMIT"),
    (0x480C, "VMCS_GUEST_LDTR_LIMIT"),
    (0x480E, "VMCS_GUEST_TR_LIMIT"),
    (0x4810, "VMCS_GUEST_GDTR_LIMIT"),
    (0x4812, "VMCS_GUEST_IDTR_LIMIT"),
    (0x4814, "VMCS_GUEST_ES_ACCESS_RIGHTS"),
    (0x4816, "VMCS_GUEST_CS_ACCESS_RIGHTS"),
    (0x4818, "VMCS_GUEST_SS_ACCESS_RIGHTS"),
    (0x481A, "VMCS_GUEST_DS_ACCESS_RIGHTS"),
    (0x481C, "VMCS_GUEST_FS_ACCESS_RIGHTS"),
    (0x481E, "VMCS_GUEST_GS_ACCESS_RIGHTS"),
    (0x4820, "VMCS_GUEST_LDTR_ACCESS_RIGHTS"),
    (0x4822, "VMCS_GUEST_TR_ACCESS_RIGHTS"),
    (0x4824, "VMCS_GUEST_INTERRUPTIBILITY_STATE"),
    (0x4826, "VMCS_GUEST_ACTIVITY_STATE"),
    (0x4828, "VMCS_GUEST_SMBASE"),
    (0x482A, "VMCS_GUEST_IA32_SYSENTER_CS"),
    (0x482E, "VMCS_VMX_PREEMPTION_TIMER_VALUE"),
    (0x4C00, "VMCS_HOST_IA32_SYSENTER_CS"),
    (0x6000, "VMCS_CR0_GUEST_HOST_MASK"),
    (0x6002, "VMCS_CR4_GUEST_HOST_MASK"),
    (0x6004, "VMCS_CR0_READ_SHADOW"),
    (0x6006, "VMCS_CR4_READ_SHADOW"),
    (0x6008, "VMCS_CR3_TARGET_VALUE0"),
    (0x600A, "VMCS_CR3_TARGET_VALUE1"),
    (0x600C, "VMCS_CR3_TARGET_VALUE2"),
    (0x600E, "VMCS_CR3_TARGET_VALUE3"),
    (0x6400, "VMCS_EXIT_QUALIFICATION"),
    (0x6402, "VMCS_IO_RCX"),
    (0x6404, "VMCS_IO_RSI"),
    (0x6406, "VMCS_IO_RDI"),
    (0x6408, "VMCS_IO_RIP"),
    (0x640A, "VMCS_GUEST_LINEAR_ADDRESS"),
    (0x6800, "VMCS_GUEST_CR0"),
    (0x6802, "VMCS_GUEST_CR3"),
    (0x6804, "VMCS_GUEST_CR4"),
    (0x6806, "VMCS_GUEST_ES_BASE"),
    (0x6808, "VMCS_GUEST_CS_BASE"),
    (0x680A, "VMCS_GUEST_SS_BASE"),
    (0x680C, "VMCS_GUEST_DS_BASE"),
    (0x680E, "VMCS_GUEST_FS_BASE"),
    (0x6810, "VMCS_GUEST_GS_BASE"),
    (0x6812, "VMCS_GUEST_LDTR_BASE"),
    (0x6814, "VMCS_GUEST_TR_BASE"),
    (0x6816, "VMCS_GUEST_GDTR_BASE"),
    (0x6818, "VMCS_GUEST_IDTR_BASE"),
    (0x681A, "VMCS_GUEST_DR7"),
    (0x681C, "VMCS_GUEST_RSP"),
    (0x681E, "VMCS_GUEST_RIP"),
    (0x6820, "VMCS_GUEST_RFLAGS"),
    (0x6822, "VMCS_GUEST_PENDING_DEBUG_EXCEPTIONS"),
    (0x6824, "VMCS_GUEST_IA32_SYSENTER_ESP"),
    (0x6826, "VMCS_GUEST_IA32_SYSENTER_EIP"),
    (0x6C00, "VMCS_HOST_CR0"),
    (0x6C02, "VMCS_HOST_CR3"),
    (0x6C04, "VMCS_HOST_CR4"),
    (0x6C06, "VMCS_HOST_FS_BASE"),
    (0x6C08, "VMCS_HOST_GS_BASE"),
    (0x6C0A, "VMCS_HOST_TR_BASE"),
    (0x6C0C, "VMCS_HOST_GDTR_BASE"),
    (0x6C0E, "VMCS_HOST_IDTR_BASE"),
    (0x6C10, "VMCS_HOST_IA32_SYSENTER_ESP"),
    (0x6C12, "VMCS_HOST_IA32_SYSENTER_EIP"),
    (0x6C14, "VMCS_HOST_RSP"),
    (0x6C16, "VMCS_HOST_RIP"),
];

/// The name of a VMCS field encoding, or [`UNDEFINED_VMCS_FIELD`].
pub fn vmcs_field_name(field: u64) -> &'static str {
    VMCS_FIELDS
        .binary_search_by_key(&field, |&(enc, _)| enc)
        .map_or(UNDEFINED_VMCS_FIELD, |idx| VMCS_FIELDS[idx].1)
}

/// Print two values on behalf of an extension.
pub fn out(val1: u64, val2: u64) {
    info!("{:#018x} {:#018x}", val1, val2);
}
