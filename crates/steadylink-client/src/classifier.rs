/*
[INPUT]:  Close codes and code-less socket failures from the transport boundary
[OUTPUT]: FailureCategory driving retry decisions
[POS]:    Core - pure failure taxonomy, no dependencies on other components
[UPDATE]: When a close code gains a dedicated meaning
*/

use crate::types::FailureCategory;

pub const NORMAL_CLOSURE: i32 = 1000;
pub const GOING_AWAY: i32 = 1001;
pub const PROTOCOL_ERROR: i32 = 1002;
pub const UNSUPPORTED_DATA: i32 = 1003;
pub const ABNORMAL_CLOSURE: i32 = 1006;
pub const INVALID_PAYLOAD: i32 = 1007;
pub const POLICY_VIOLATION: i32 = 1008;
pub const MESSAGE_TOO_BIG: i32 = 1009;
pub const INTERNAL_ERROR: i32 = 1011;

/// Code recorded when the transport reported no close code at all.
pub const NO_CODE: i32 = 0;

/// What the transport told us when an episode or open attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSignal {
    /// Close with an optional close code.
    Close { code: Option<i32> },
    /// One-off socket error with no close code attached.
    SocketError,
}

impl FailureSignal {
    /// Code to store in a `FailureRecord`.
    pub fn record_code(self) -> i32 {
        match self {
            FailureSignal::Close { code: Some(code) } => code,
            FailureSignal::Close { code: None } => ABNORMAL_CLOSURE,
            FailureSignal::SocketError => NO_CODE,
        }
    }
}

/// Classify a close code. Total: unknown codes are `Recoverable`.
pub fn classify(code: i32) -> FailureCategory {
    match code {
        PROTOCOL_ERROR | UNSUPPORTED_DATA | INVALID_PAYLOAD | POLICY_VIOLATION
        | MESSAGE_TOO_BIG => FailureCategory::Fatal,
        NORMAL_CLOSURE | GOING_AWAY | ABNORMAL_CLOSURE | INTERNAL_ERROR => {
            FailureCategory::Recoverable
        }
        _ => FailureCategory::Recoverable,
    }
}

/// Classify a transport signal, including failures that carry no close code.
pub fn classify_signal(signal: FailureSignal) -> FailureCategory {
    match signal {
        FailureSignal::Close { code: Some(code) } => classify(code),
        // A close without a frame is an abnormal closure.
        FailureSignal::Close { code: None } => classify(ABNORMAL_CLOSURE),
        FailureSignal::SocketError => FailureCategory::Transient,
    }
}

/// Human label for a close code, for logs and failure messages.
pub fn close_code_name(code: i32) -> &'static str {
    match code {
        NO_CODE => "no close code",
        NORMAL_CLOSURE => "normal closure",
        GOING_AWAY => "going away",
        PROTOCOL_ERROR => "protocol error",
        UNSUPPORTED_DATA => "invalid data",
        ABNORMAL_CLOSURE => "abnormal closure",
        INVALID_PAYLOAD => "invalid payload",
        POLICY_VIOLATION => "policy violation",
        MESSAGE_TOO_BIG => "message too big",
        INTERNAL_ERROR => "internal error",
        _ => "unknown close code",
    }
}
