use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    leds::{DeviceState, LedUpdate},
    routing::Method,
    types::{ControlAck, ErrorBody},
};

pub const MAX_CONTROL_BODY: usize = 16 * 1024;
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: Vec<u8>,
}

impl ControlResponse {
    fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        match serde_json::to_vec(payload) {
            Ok(body) => Self {
                status,
                content_type: Some(JSON_CONTENT_TYPE),
                body,
            },
            Err(err) => {
                warn!("control response serialization failed: {err}");
                Self::empty(500)
            }
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::json(200, &ControlAck::OK)
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, &ErrorBody::new(message))
    }

    pub fn payload_too_large() -> Self {
        Self::error(
            413,
            format!("request body exceeds {MAX_CONTROL_BODY} bytes"),
        )
    }
}

/// Handles a request routed to the control path. Only POST mutates state;
/// every other method is answered with an empty 405.
pub fn handle_control_request(
    state: &DeviceState,
    method: Method,
    content_type: Option<&str>,
    body: &[u8],
) -> ControlResponse {
    if method != Method::Post {
        return ControlResponse::empty(405);
    }

    if body.len() > MAX_CONTROL_BODY {
        return ControlResponse::payload_too_large();
    }

    let update = match LedUpdate::parse(content_type, body) {
        Ok(Some(update)) => update,
        Ok(None) => {
            debug!("empty control body acknowledged");
            return ControlResponse::ok();
        }
        Err(err) => {
            debug!("rejected control body: {err}");
            return ControlResponse::error(400, err.to_string());
        }
    };

    match state.apply(&update) {
        Ok(revision) => {
            debug!("led state updated to revision {revision}");
            ControlResponse::ok()
        }
        Err(err) => {
            debug!("rejected led update: {err}");
            ControlResponse::error(400, err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::Rgb;

    #[test]
    fn post_acknowledges_with_json() {
        let state = DeviceState::new(4);

        let response = handle_control_request(
            &state,
            Method::Post,
            Some("application/json"),
            br#"{"fill":[0,255,0]}"#,
        );

        assert_eq!(response.status, 200);
        assert_eq!(response.content_type, Some("application/json"));
        assert_eq!(response.body, br#"{"status":"ok"}"#.to_vec());
        assert_eq!(state.snapshot().pixels[2], Rgb::new(0, 255, 0));
    }

    #[test]
    fn empty_post_is_acknowledged_without_mutation() {
        let state = DeviceState::new(4);

        let response = handle_control_request(&state, Method::Post, None, b"");

        assert_eq!(response, ControlResponse::ok());
        assert_eq!(state.revision(), 0);
    }

    #[test]
    fn other_methods_get_empty_405() {
        let state = DeviceState::new(4);

        for method in [Method::Get, Method::Put, Method::Delete, Method::Head] {
            assert_eq!(
                handle_control_request(&state, method, None, b""),
                ControlResponse::empty(405)
            );
        }
    }

    #[test]
    fn invalid_bodies_get_400_with_error_json() {
        let state = DeviceState::new(4);

        let response = handle_control_request(
            &state,
            Method::Post,
            None,
            br#"{"pixels":[{"index":9,"color":[1,2,3]}]}"#,
        );

        assert_eq!(response.status, 400);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "pixel index 9 out of range for 4 leds");
    }

    #[test]
    fn oversized_body_gets_413() {
        let state = DeviceState::new(4);
        let body = vec![b' '; MAX_CONTROL_BODY + 1];

        let response = handle_control_request(&state, Method::Post, None, &body);

        assert_eq!(response.status, 413);
    }
}
