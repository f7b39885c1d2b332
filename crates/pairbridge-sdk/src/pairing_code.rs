// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pairing code generation and normalization.
//!
//! The backend hands out pairing payloads in one of three forms: an image data
//! URI, bare base64 image bytes, or the messaging network's own opaque pairing
//! string. [`normalize`] turns all of them into an image data URI; the opaque
//! string is rendered as a QR code and never interpreted.

use std::io::Cursor;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendClient, Operation};
use crate::config::PairingConfig;
use crate::error::{PairingError, Result};
use crate::provision::InstanceProvisioner;
use crate::status::parse_status;
use crate::types::{BackendFlavor, PairingResult};

const PAYLOAD_FIELDS: &[&str] = &["qrcode", "qr", "base64"];
const NESTED_PAYLOAD_FIELDS: &[&str] = &["base64", "qrcode", "qr", "code"];
const BASE64_PREFIX_LEN: usize = 64;
const QR_MIN_DIMENSION: u32 = 264;
const INVALID_CODE: &str = "invalid/unexpected code";

/// Normalize a raw pairing payload into an image data URI.
pub fn normalize(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PairingError::QrGeneration(INVALID_CODE.to_string()));
    }
    if raw.starts_with("data:") {
        return Ok(raw.to_string());
    }
    if looks_like_base64_image(raw) {
        return Ok(format!("data:image/png;base64,{}", raw));
    }
    render_qr_data_uri(raw)
}

fn looks_like_base64_image(raw: &str) -> bool {
    raw.len() >= BASE64_PREFIX_LEN
        && raw
            .bytes()
            .take(BASE64_PREFIX_LEN)
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

fn render_qr_data_uri(payload: &str) -> Result<String> {
    let code = QrCode::new(payload.as_bytes()).map_err(|e| {
        warn!(error = %e, payload_len = payload.len(), "Pairing payload cannot be encoded");
        PairingError::QrGeneration(INVALID_CODE.to_string())
    })?;
    let rendered = code
        .render::<Luma<u8>>()
        .min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
        .quiet_zone(true)
        .build();

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(rendered)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| {
            warn!(error = %e, "Failed to encode pairing code image");
            PairingError::QrGeneration(INVALID_CODE.to_string())
        })?;

    Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
}

/// Pull the raw payload out of a code response.
fn extract_payload(body: &Value) -> Option<&str> {
    match body {
        Value::String(s) if !s.trim().is_empty() => Some(s.as_str()),
        Value::Object(_) => {
            payload_from_object(body).or_else(|| body.get("data").and_then(payload_from_object))
        }
        _ => None,
    }
}

fn payload_from_object(obj: &Value) -> Option<&str> {
    PAYLOAD_FIELDS.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
        Some(inner @ Value::Object(_)) => NESTED_PAYLOAD_FIELDS
            .iter()
            .find_map(|k| inner.get(*k).and_then(Value::as_str))
            .filter(|s| !s.trim().is_empty()),
        _ => None,
    })
}

/// Turn a successful code response into a result, or `None` when no code is ready yet.
fn interpret_code_response(body: &Value) -> Result<Option<PairingResult>> {
    let report = parse_status(body);
    if report.connected {
        return Ok(Some(PairingResult::AlreadyConnected {
            phone_number: report.phone_number,
        }));
    }
    match extract_payload(body) {
        Some(raw) => normalize(raw).map(|uri| Some(PairingResult::Code(uri))),
        None => Ok(None),
    }
}

/// Starts connection attempts and fetches displayable pairing codes.
#[derive(Clone)]
pub struct PairingCodeGenerator {
    client: BackendClient,
    provisioner: InstanceProvisioner,
    request_timeout: Duration,
    qr_timeout: Duration,
    grace_period: Duration,
    retry_delay: Duration,
    attempts: u32,
}

impl PairingCodeGenerator {
    pub fn new(client: BackendClient, config: &PairingConfig) -> Self {
        Self {
            provisioner: InstanceProvisioner::new(client.clone(), config.request_timeout()),
            client,
            request_timeout: config.request_timeout(),
            qr_timeout: config.qr_timeout(),
            grace_period: Duration::from_millis(config.qr_grace_period_ms),
            retry_delay: Duration::from_millis(config.qr_retry_delay_ms),
            attempts: config.qr_fetch_attempts.max(1),
        }
    }

    /// Provision, start a connection attempt and fetch a pairing code.
    #[instrument(skip(self), fields(backend = %self.client.descriptor().base_url()))]
    pub async fn generate(&self, instance_id: &str, hint: &str) -> Result<PairingResult> {
        let descriptor = self.client.descriptor();

        self.provisioner.ensure(instance_id, hint).await?;
        self.start_connect(instance_id).await;
        if !self.grace_period.is_zero() {
            tokio::time::sleep(self.grace_period).await;
        }

        for attempt in 1..=self.attempts {
            let response = self
                .client
                .call(Operation::QrCode, instance_id, None, self.qr_timeout)
                .await
                .map_err(|e| PairingError::QrGeneration(e.to_string()))?;

            if response.is_success() {
                if !descriptor.is_legacy() {
                    descriptor.set_flavor(BackendFlavor::Versioned);
                }
                if let Some(result) = interpret_code_response(&response.body)? {
                    info!(attempt, "Pairing code obtained");
                    return Ok(result);
                }
                debug!(attempt, "Backend has no pairing code yet");
            } else if response.is_not_found() {
                if attempt == 1 && !descriptor.is_legacy() {
                    warn!(
                        message = %response.message(),
                        "Code endpoint returned 404, re-provisioning"
                    );
                    self.provisioner.ensure(instance_id, hint).await?;
                    self.start_connect(instance_id).await;
                } else {
                    return self.legacy_fallback(instance_id).await;
                }
            } else {
                return Err(PairingError::QrGeneration(response.message()));
            }

            if attempt < self.attempts && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(PairingError::QrGeneration(
            "pairing code not available, retry later".to_string(),
        ))
    }

    /// Best-effort "start connect". Some backends start on the first code
    /// read, so failures are only logged.
    async fn start_connect(&self, instance_id: &str) {
        match self
            .client
            .call(Operation::Connect, instance_id, None, self.request_timeout)
            .await
        {
            Ok(response) if response.is_success() => debug!("Connect started"),
            Ok(response) => debug!(
                status = response.status,
                message = %response.message(),
                "Connect call rejected, continuing"
            ),
            Err(e) => debug!(error = %e, "Connect call failed, continuing"),
        }
    }

    /// One-shot retry through the legacy endpoint set.
    async fn legacy_fallback(&self, instance_id: &str) -> Result<PairingResult> {
        let descriptor = self.client.descriptor();
        let previous = descriptor.flavor();

        if previous != BackendFlavor::Legacy {
            info!("Trying legacy code endpoint");
            descriptor.set_flavor(BackendFlavor::Legacy);
            self.start_connect(instance_id).await;

            let fallback = self
                .client
                .call_as(
                    Operation::QrCode,
                    BackendFlavor::Legacy,
                    instance_id,
                    None,
                    self.qr_timeout,
                )
                .await;
            if let Ok(response) = fallback {
                if response.is_success() {
                    if let Some(result) = interpret_code_response(&response.body)? {
                        return Ok(result);
                    }
                }
            }

            descriptor.set_flavor(match previous {
                BackendFlavor::Unknown => BackendFlavor::Versioned,
                other => other,
            });
        }

        Err(PairingError::QrGeneration(
            "backend is outdated: no pairing code endpoint available, update the bridge service"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn png_base64() -> String {
        // 1x1 transparent PNG
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII="
            .to_string()
    }

    #[test]
    fn test_normalize_keeps_data_uri() {
        let uri = format!("data:image/png;base64,{}", png_base64());
        assert_eq!(normalize(&uri).unwrap(), uri);
        // idempotent
        assert_eq!(normalize(&normalize(&uri).unwrap()).unwrap(), uri);
    }

    #[test]
    fn test_normalize_wraps_bare_base64() {
        let raw = png_base64();
        assert_eq!(
            normalize(&raw).unwrap(),
            format!("data:image/png;base64,{}", raw)
        );
    }

    #[test]
    fn test_normalize_renders_opaque_pairing_string() {
        let raw = "2@AbCdEfGhIjKlMnOpQrStUvWxYz0123456789+/AbCd==,XyZ0123456789abcdef=,Zz9+/w==,1";
        let uri = normalize(raw).unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));

        let encoded = uri.trim_start_matches("data:image/png;base64,");
        let bytes = STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        // not the raw string re-wrapped
        assert_ne!(bytes, raw.as_bytes());
        assert!(!encoded.contains(raw));
        assert_eq!(normalize(&uri).unwrap(), uri);
    }

    #[test]
    fn test_normalize_short_alphanumeric_is_rendered() {
        let uri = normalize("ABC123").unwrap();
        let bytes = STANDARD
            .decode(uri.trim_start_matches("data:image/png;base64,"))
            .unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
    }

    #[test]
    fn test_normalize_rejects_empty_and_oversized() {
        assert!(matches!(
            normalize("   "),
            Err(PairingError::QrGeneration(msg)) if msg == INVALID_CODE
        ));
        let too_long = "@".repeat(8_000);
        assert!(matches!(
            normalize(&too_long),
            Err(PairingError::QrGeneration(msg)) if msg == INVALID_CODE
        ));
    }

    #[test]
    fn test_extract_payload_fields() {
        assert_eq!(extract_payload(&json!({"qrcode": "2@abc"})), Some("2@abc"));
        assert_eq!(extract_payload(&json!({"qr": "2@abc"})), Some("2@abc"));
        assert_eq!(extract_payload(&json!({"base64": "iVBOR"})), Some("iVBOR"));
        assert_eq!(
            extract_payload(&json!({"data": {"qrcode": "2@abc"}})),
            Some("2@abc")
        );
        assert_eq!(
            extract_payload(&json!({"qrcode": {"base64": "data:image/png;base64,xx"}})),
            Some("data:image/png;base64,xx")
        );
        assert_eq!(extract_payload(&json!({"qrcode": ""})), None);
        assert_eq!(extract_payload(&json!({"status": "qr_pending"})), None);
        assert_eq!(extract_payload(&json!("2@raw,text")), Some("2@raw,text"));
    }

    #[test]
    fn test_interpret_connected_wins_over_payload() {
        let result = interpret_code_response(&json!({"connected": true, "qrcode": "2@abc"}))
            .unwrap()
            .unwrap();
        assert_eq!(
            result,
            PairingResult::AlreadyConnected { phone_number: None }
        );
    }
}
