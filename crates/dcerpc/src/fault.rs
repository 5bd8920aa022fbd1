//! Fault and status codes
//!
//! A fault PDU carries a 32-bit status. The `nca_s_*` values come from the
//! connection-oriented protocol itself; the `rpc_s_*`/Win32 values are what
//! Windows peers put in the same field.

use std::fmt;

/// Status carried by a fault PDU or returned by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultCode(pub u32);

macro_rules! fault_codes {
    ($( $(#[$doc:meta])* $name:ident = $value:literal, $text:literal; )*) => {
        impl FaultCode {
            $(
                $(#[$doc])*
                pub const $name: Self = Self($value);
            )*

            /// Symbolic name of a well-known status
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $( $value => Some($text), )*
                    _ => None,
                }
            }
        }
    };
}

fault_codes! {
    /// Win32 `ERROR_ACCESS_DENIED`
    ACCESS_DENIED = 0x0000_0005, "access_denied";
    /// Win32 `ERROR_INVALID_HANDLE`
    INVALID_HANDLE = 0x0000_0006, "invalid_handle";
    /// Win32 `ERROR_OUTOFMEMORY`
    OUT_OF_MEMORY = 0x0000_000e, "out_of_memory";
    /// Win32 `ERROR_INVALID_PARAMETER`
    INVALID_PARAMETER = 0x0000_0057, "invalid_parameter";
    RPC_S_UNKNOWN_IF = 0x0000_06b5, "rpc_s_unknown_if";
    RPC_S_SERVER_UNAVAILABLE = 0x0000_06ba, "rpc_s_server_unavailable";
    RPC_S_CALL_FAILED = 0x0000_06be, "rpc_s_call_failed";
    RPC_S_CALL_FAILED_DNE = 0x0000_06bf, "rpc_s_call_failed_dne";
    RPC_S_PROTOCOL_ERROR = 0x0000_06c0, "rpc_s_protocol_error";
    RPC_S_PROCNUM_OUT_OF_RANGE = 0x0000_06d1, "rpc_s_procnum_out_of_range";
    RPC_X_BAD_STUB_DATA = 0x0000_06f7, "rpc_x_bad_stub_data";
    RPC_S_CALL_CANCELLED = 0x0000_071a, "rpc_s_call_cancelled";
    FAULT_INT_DIV_BY_ZERO = 0x1c00_0001, "nca_s_fault_int_div_by_zero";
    FAULT_ADDR_ERROR = 0x1c00_0002, "nca_s_fault_addr_error";
    FAULT_INVALID_TAG = 0x1c00_0006, "nca_s_fault_invalid_tag";
    FAULT_INVALID_BOUND = 0x1c00_0007, "nca_s_fault_invalid_bound";
    /// Peer does not speak this protocol version
    RPC_VERSION_MISMATCH = 0x1c00_0008, "nca_s_rpc_version_mismatch";
    UNSPEC_REJECT = 0x1c00_0009, "nca_s_unspec_reject";
    MANAGER_NOT_ENTERED = 0x1c00_000c, "nca_s_manager_not_entered";
    FAULT_CANCEL = 0x1c00_000d, "nca_s_fault_cancel";
    FAULT_UNSPEC = 0x1c00_0012, "nca_s_fault_unspec";
    FAULT_REMOTE_COMM_FAILURE = 0x1c00_0013, "nca_s_fault_remote_comm_failure";
    /// Context handle not recognized by the server
    CONTEXT_MISMATCH = 0x1c00_001a, "nca_s_fault_context_mismatch";
    FAULT_REMOTE_NO_MEMORY = 0x1c00_001b, "nca_s_fault_remote_no_memory";
    INVALID_PRES_CONTEXT_ID = 0x1c00_001c, "nca_s_invalid_pres_context_id";
    UNSUPPORTED_AUTHN_LEVEL = 0x1c00_001d, "nca_s_unsupported_authn_level";
    INVALID_CHECKSUM = 0x1c00_001f, "nca_s_invalid_checksum";
    INVALID_CRC = 0x1c00_0020, "nca_s_invalid_crc";
    FAULT_USER_DEFINED = 0x1c00_0021, "nca_s_fault_user_defined";
    FAULT_OBJECT_NOT_FOUND = 0x1c00_0024, "nca_s_fault_object_not_found";
    COMM_FAILURE = 0x1c01_0001, "nca_s_comm_failure";
    /// Opnum outside the interface
    OP_RANGE_ERROR = 0x1c01_0002, "nca_s_op_rng_error";
    /// Interface not registered on the server
    UNKNOWN_INTERFACE = 0x1c01_0003, "nca_s_unk_if";
    WRONG_BOOT_TIME = 0x1c01_0006, "nca_s_wrong_boot_time";
    YOU_CRASHED = 0x1c01_0009, "nca_s_you_crashed";
    PROTOCOL_ERROR = 0x1c01_000b, "nca_s_proto_error";
    OUT_ARGS_TOO_BIG = 0x1c01_0013, "nca_s_out_args_too_big";
    SERVER_TOO_BUSY = 0x1c01_0014, "nca_s_server_too_busy";
    UNSUPPORTED_TYPE = 0x1c01_0017, "nca_s_unsupported_type";
}

impl FaultCode {
    pub fn code(&self) -> u32 {
        self.0
    }

    /// `0x1c00_xxxx` and `0x1c01_xxxx` codes are defined by the protocol itself
    pub fn is_protocol_status(&self) -> bool {
        self.0 & 0xffff_0000 == 0x1c00_0000 || self.0 & 0xffff_0000 == 0x1c01_0000
    }
}

impl From<u32> for FaultCode {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:08x})", name, self.0),
            None => write!(f, "0x{:08x}", self.0),
        }
    }
}
