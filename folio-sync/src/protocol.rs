//! Binary protocol for CRDT state synchronization.
//!
//! Wire format (first byte = message class):
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────────────────┐
//! │ class    │ step     │ payload                                 │
//! │ 1 byte   │ 1 byte   │ variable                                │
//! ├──────────┼──────────┼─────────────────────────────────────────┤
//! │ 0 sync   │ 0 step1  │ encoded state vector                    │
//! │ 0 sync   │ 1 step2  │ raw update                              │
//! │ 0 sync   │ 2 update │ raw update                              │
//! │ 1 presence          │ opaque passthrough                      │
//! │ 2 auth   (out)      │ length-prefixed credential string       │
//! │ 2 auth   (in)       │ success flag byte, optional message str │
//! └─────────────────────┴─────────────────────────────────────────┘
//! ```
//!
//! Parsing never fails: anything that cannot be understood comes back as
//! [`SyncMessage::Unknown`] and the caller drops it.

use crate::state_vector::StateVector;
use crate::varint::{encode_string, encode_var_uint, CodecError, VarReader};

/// Outer envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageClass {
    /// State-vector exchange and updates
    Sync = 0,
    /// Cursor/selection awareness, passed through untouched
    Presence = 1,
    /// Credential handshake
    Auth = 2,
}

impl MessageClass {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Sync),
            1 => Some(Self::Presence),
            2 => Some(Self::Auth),
            _ => None,
        }
    }
}

/// Inner discriminator for sync-class messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncStep {
    /// "Here is my state vector, what have I missed?"
    Step1 = 0,
    /// Reply to step 1 with the missing updates
    Step2 = 1,
    /// Incremental update
    Update = 2,
}

impl SyncStep {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Step1),
            1 => Some(Self::Step2),
            2 => Some(Self::Update),
            _ => None,
        }
    }
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Step1(StateVector),
    Step2(Vec<u8>),
    Update(Vec<u8>),
    Presence(Vec<u8>),
    Auth {
        success: bool,
        message: Option<String>,
    },
    /// The byte that could not be interpreted; `None` for empty input.
    Unknown(Option<u8>),
}

impl SyncMessage {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Step1(_) => "step1",
            Self::Step2(_) => "step2",
            Self::Update(_) => "update",
            Self::Presence(_) => "presence",
            Self::Auth { .. } => "auth",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Encode a state vector: entry count, then `(origin, clock)` pairs.
pub fn encode_state_vector(sv: &StateVector) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + sv.len() * 4);
    write_state_vector(sv, &mut out);
    out
}

fn write_state_vector(sv: &StateVector, out: &mut Vec<u8>) {
    encode_var_uint(sv.len() as u64, out);
    for (origin, clock) in sv.iter() {
        encode_var_uint(origin, out);
        encode_var_uint(clock, out);
    }
}

/// Decode a state vector.
///
/// The entry count comes off the wire untrusted: every entry needs at least
/// two bytes, so a count the remaining input cannot hold is rejected.
pub fn decode_state_vector(data: &[u8]) -> Result<StateVector, CodecError> {
    let mut reader = VarReader::new(data);
    read_state_vector(&mut reader)
}

pub(crate) fn read_state_vector(reader: &mut VarReader<'_>) -> Result<StateVector, CodecError> {
    let count = reader.read_var_uint();
    if count > (reader.remaining() / 2) as u64 {
        return Err(CodecError::LengthOverflow(count));
    }
    let mut sv = StateVector::new();
    for _ in 0..count {
        if reader.is_empty() {
            return Err(CodecError::Truncated {
                needed: 1,
                available: 0,
            });
        }
        let origin = reader.read_var_uint();
        if reader.is_empty() {
            return Err(CodecError::Truncated {
                needed: 1,
                available: 0,
            });
        }
        let clock = reader.read_var_uint();
        sv.set(origin, clock);
    }
    Ok(sv)
}

fn sync_frame(step: SyncStep, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(MessageClass::Sync as u8);
    out.push(step as u8);
    out.extend_from_slice(payload);
    out
}

/// Step 1: announce our state vector.
pub fn create_step1(sv: &StateVector) -> Vec<u8> {
    let mut out = vec![MessageClass::Sync as u8, SyncStep::Step1 as u8];
    write_state_vector(sv, &mut out);
    out
}

/// Step 2: answer a step 1 with an update payload.
pub fn create_step2(update: &[u8]) -> Vec<u8> {
    sync_frame(SyncStep::Step2, update)
}

/// Incremental update.
pub fn create_update(update: &[u8]) -> Vec<u8> {
    sync_frame(SyncStep::Update, update)
}

/// Outbound auth: class byte then the length-prefixed credential.
pub fn create_auth_message(token: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + token.len());
    out.push(MessageClass::Auth as u8);
    encode_string(token, &mut out);
    out
}

/// Presence passthrough.
pub fn create_presence(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(MessageClass::Presence as u8);
    out.extend_from_slice(payload);
    out
}

/// Parse an inbound frame.
pub fn parse_message(data: &[u8]) -> SyncMessage {
    let mut reader = VarReader::new(data);
    let Some(class_byte) = reader.read_u8() else {
        return SyncMessage::Unknown(None);
    };

    match MessageClass::from_byte(class_byte) {
        Some(MessageClass::Sync) => {
            let Some(step_byte) = reader.read_u8() else {
                return SyncMessage::Unknown(Some(class_byte));
            };
            match SyncStep::from_byte(step_byte) {
                Some(SyncStep::Step1) => match read_state_vector(&mut reader) {
                    Ok(sv) => SyncMessage::Step1(sv),
                    Err(e) => {
                        log::debug!("Malformed step1 state vector: {e}");
                        SyncMessage::Unknown(Some(step_byte))
                    }
                },
                Some(SyncStep::Step2) => SyncMessage::Step2(reader.rest().to_vec()),
                Some(SyncStep::Update) => SyncMessage::Update(reader.rest().to_vec()),
                None => SyncMessage::Unknown(Some(step_byte)),
            }
        }
        Some(MessageClass::Presence) => SyncMessage::Presence(reader.rest().to_vec()),
        Some(MessageClass::Auth) => {
            let success = reader.read_u8() == Some(1);
            let message = if reader.is_empty() {
                None
            } else {
                // A garbled trailer does not change the verdict.
                reader.read_string().ok()
            };
            SyncMessage::Auth { success, message }
        }
        None => SyncMessage::Unknown(Some(class_byte)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sv(entries: &[(u64, u64)]) -> StateVector {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_state_vector_roundtrip() {
        let original = sv(&[(1, 5), (1_700_000_000_123, 42), (300, 0)]);
        let encoded = encode_state_vector(&original);
        assert_eq!(decode_state_vector(&encoded).unwrap(), original);
    }

    #[test]
    fn test_empty_state_vector_is_one_byte() {
        assert_eq!(encode_state_vector(&StateVector::new()), vec![0]);
    }

    #[test]
    fn test_state_vector_count_is_bounded() {
        // Claims 1000 entries with 2 bytes of body.
        let mut data = Vec::new();
        encode_var_uint(1000, &mut data);
        data.extend_from_slice(&[1, 1]);
        assert_eq!(
            decode_state_vector(&data),
            Err(CodecError::LengthOverflow(1000))
        );
    }

    #[test]
    fn test_step1_layout() {
        let msg = create_step1(&StateVector::new());
        assert_eq!(msg, vec![0, 0, 0]);
    }

    #[test]
    fn test_step1_roundtrip() {
        let vector = sv(&[(7, 3)]);
        let parsed = parse_message(&create_step1(&vector));
        assert_eq!(parsed, SyncMessage::Step1(vector));
    }

    #[test]
    fn test_step2_and_update_layout() {
        assert_eq!(create_step2(&[9, 8]), vec![0, 1, 9, 8]);
        assert_eq!(create_update(&[9, 8]), vec![0, 2, 9, 8]);
        assert_eq!(parse_message(&[0, 1, 9, 8]), SyncMessage::Step2(vec![9, 8]));
        assert_eq!(parse_message(&[0, 2, 9, 8]), SyncMessage::Update(vec![9, 8]));
    }

    #[test]
    fn test_auth_message_layout() {
        assert_eq!(create_auth_message("id:secret"), {
            let mut v = vec![2, 9];
            v.extend_from_slice(b"id:secret");
            v
        });
    }

    #[test]
    fn test_parse_auth_success_without_message() {
        assert_eq!(
            parse_message(&[2, 1]),
            SyncMessage::Auth {
                success: true,
                message: None
            }
        );
    }

    #[test]
    fn test_parse_auth_failure_with_message() {
        let mut data = vec![2, 0];
        encode_string("bad token", &mut data);
        assert_eq!(
            parse_message(&data),
            SyncMessage::Auth {
                success: false,
                message: Some("bad token".into())
            }
        );
    }

    #[test]
    fn test_parse_auth_truncated_message_keeps_verdict() {
        assert_eq!(
            parse_message(&[2, 1, 20, b'x']),
            SyncMessage::Auth {
                success: true,
                message: None
            }
        );
    }

    #[test]
    fn test_parse_presence_passthrough() {
        assert_eq!(
            parse_message(&create_presence(&[1, 2, 3])),
            SyncMessage::Presence(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_parse_malformed_is_unknown() {
        assert_eq!(parse_message(&[]), SyncMessage::Unknown(None));
        assert_eq!(parse_message(&[0xFF]), SyncMessage::Unknown(Some(0xFF)));
        assert_eq!(parse_message(&[0]), SyncMessage::Unknown(Some(0)));
        assert_eq!(parse_message(&[0, 9]), SyncMessage::Unknown(Some(9)));
        // Step1 whose state vector claims more entries than present
        assert_eq!(parse_message(&[0, 0, 50, 1]), SyncMessage::Unknown(Some(0)));
    }

    #[test]
    fn test_message_class_values() {
        assert_eq!(MessageClass::Sync as u8, 0);
        assert_eq!(MessageClass::Presence as u8, 1);
        assert_eq!(MessageClass::Auth as u8, 2);
        assert_eq!(SyncStep::Update as u8, 2);
        assert_eq!(MessageClass::from_byte(3), None);
    }
}
