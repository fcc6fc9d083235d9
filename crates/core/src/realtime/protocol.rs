//! Defines the text framing exchanged with the realtime endpoint.
//!
//! Outbound frames are `"SEND " + JSON(ActivityEvent)`. Inbound frames are
//! either a keep-alive (`"OK"` or empty) or a bare `JSON(ActivityEvent)`.

use crate::models::ActivityEvent;

/// Command token every outbound frame starts with.
pub const SEND_COMMAND: &str = "SEND ";

/// Keep-alive acknowledgement sent by the server.
pub const KEEP_ALIVE: &str = "OK";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("invalid activity payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    KeepAlive,
    Activity(ActivityEvent),
}

/// Path of the streaming endpoint for a session and its participants.
///
/// The participant list is whatever the caller passes; it is not refreshed
/// for the lifetime of the connection.
pub fn connection_path(session_id: &str, user_ids: &[String]) -> String {
    format!("websocket/{}/{}", session_id, user_ids.join(","))
}

pub fn encode_outbound(event: &ActivityEvent) -> Result<String, serde_json::Error> {
    let payload = serde_json::to_string(event)?;
    Ok(format!("{}{}", SEND_COMMAND, payload))
}

pub fn decode_inbound(payload: &[u8]) -> Result<InboundFrame, FrameError> {
    let text = std::str::from_utf8(payload)?;
    if text.is_empty() || text == KEEP_ALIVE {
        return Ok(InboundFrame::KeepAlive);
    }
    Ok(InboundFrame::Activity(serde_json::from_str(text)?))
}
