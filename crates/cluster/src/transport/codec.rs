//! Wire framing: length prefix, kind byte, JSON payload

use super::{Message, TransportError};

/// Upper bound on one frame, keeping probe latency predictable
pub const MAX_FRAME: usize = 64 * 1024;

/// Bytes of the length prefix
const HEADER_LEN: usize = 4;

/// Encode a message as one frame
pub fn encode(message: &Message) -> Result<Vec<u8>, TransportError> {
    let payload =
        serde_json::to_vec(message).map_err(|err| TransportError::Encode(err.to_string()))?;

    let frame_len = HEADER_LEN + 1 + payload.len();
    if frame_len > MAX_FRAME {
        return Err(TransportError::FrameTooLarge(frame_len));
    }

    let mut frame = Vec::with_capacity(frame_len);
    frame.extend_from_slice(&((1 + payload.len()) as u32).to_le_bytes());
    frame.push(message.kind_byte());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame back into a message
pub fn decode(frame: &[u8]) -> Result<Message, TransportError> {
    if frame.len() < HEADER_LEN + 1 {
        return Err(TransportError::Decode(format!(
            "frame of {} bytes is too short",
            frame.len()
        )));
    }

    let length = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = &frame[HEADER_LEN..];
    if body.len() != length {
        return Err(TransportError::Decode(format!(
            "length prefix {length} does not match body of {} bytes",
            body.len()
        )));
    }

    let kind = body[0];
    let message: Message =
        serde_json::from_slice(&body[1..]).map_err(|err| TransportError::Decode(err.to_string()))?;

    if message.kind_byte() != kind {
        return Err(TransportError::Decode(format!(
            "kind byte {kind} does not match payload kind {}",
            message.kind_byte()
        )));
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{GossipUpdate, NodeState};
    use gridflow_runtime::SubmitOutcome;
    use serde_json::json;

    fn sample_ping() -> Message {
        Message::Ping {
            from_id: "node-1".to_string(),
            from_incarnation: 3,
            updates: vec![GossipUpdate {
                node_id: "node-2".to_string(),
                addr: "127.0.0.1:7801".parse().unwrap(),
                state: NodeState::Suspect,
                incarnation: 1,
            }],
        }
    }

    #[test]
    fn test_roundtrip_ping() {
        let frame = encode(&sample_ping()).unwrap();
        let decoded = decode(&frame).unwrap();
        match decoded {
            Message::Ping {
                from_id,
                from_incarnation,
                updates,
            } => {
                assert_eq!(from_id, "node-1");
                assert_eq!(from_incarnation, 3);
                assert_eq!(updates.len(), 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip_submit_ack() {
        let message = Message::WorkflowSubmitAck {
            workflow_id: "wf-1".to_string(),
            outcome: SubmitOutcome::Completed(json!({"total": 10})),
        };

        let frame = encode(&message).unwrap();
        match decode(&frame).unwrap() {
            Message::WorkflowSubmitAck { workflow_id, outcome } => {
                assert_eq!(workflow_id, "wf-1");
                assert_eq!(outcome, SubmitOutcome::Completed(json!({"total": 10})));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_kind_byte_mismatch_rejected() {
        let mut frame = encode(&sample_ping()).unwrap();
        frame[4] = 3; // claims to be an ack
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut frame = encode(&sample_ping()).unwrap();
        frame.truncate(frame.len() - 2);
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let message = Message::WorkflowSubmit {
            workflow_id: "wf-big".to_string(),
            workflow_name: "noop".to_string(),
            input: json!("x".repeat(MAX_FRAME)),
        };
        let err = encode(&message).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));
    }
}
