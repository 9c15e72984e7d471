use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use thiserror::Error;

use crate::types::Rgb;

pub const FRAME_FILE_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 12;
pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("malformed update body: {0}")]
    Malformed(String),
    #[error("pixel index {index} out of range for {len} leds")]
    IndexOutOfRange { index: u64, len: usize },
    #[error("color component {0} outside 0..=255")]
    ComponentOutOfRange(i64),
    #[error("unsupported frame file version {0}")]
    UnsupportedVersion(u8),
    #[error("frame file truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("frame of {pixels} pixels does not fit a strip of {len}")]
    FrameTooLarge { pixels: usize, len: usize },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchBody {
    #[serde(default)]
    clear: bool,
    #[serde(default)]
    fill: Option<[i64; 3]>,
    #[serde(default)]
    pixels: Vec<PixelBody>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PixelBody {
    index: u64,
    color: [i64; 3],
}

fn color_from_components(components: [i64; 3]) -> Result<Rgb, UpdateError> {
    let mut out = [0_u8; 3];
    for (slot, value) in out.iter_mut().zip(components) {
        *slot = u8::try_from(value).map_err(|_| UpdateError::ComponentOutOfRange(value))?;
    }
    Ok(Rgb::from(out))
}

/// First frame of an uploaded LED frame file (12-byte big-endian header followed
/// by row-major RGB triples for every frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedFrame {
    pub rows: u8,
    pub columns: u8,
    pub frames: u8,
    pub created: u32,
    pub updated: u32,
    pub pixels: Vec<Rgb>,
}

impl LedFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, UpdateError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(UpdateError::Truncated {
                expected: FRAME_HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let version = bytes[0];
        if version != FRAME_FILE_VERSION {
            return Err(UpdateError::UnsupportedVersion(version));
        }

        let (rows, columns, frames) = (bytes[1], bytes[2], bytes[3]);
        let created = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let updated = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        let per_frame = rows as usize * columns as usize;
        if per_frame == 0 || frames == 0 {
            return Err(UpdateError::Malformed("frame file has no pixels".to_string()));
        }

        let expected = FRAME_HEADER_LEN + per_frame * frames as usize * 3;
        if bytes.len() < expected {
            return Err(UpdateError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(UpdateError::Malformed(format!(
                "{} trailing bytes after frame data",
                bytes.len() - expected
            )));
        }

        let pixels = bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + per_frame * 3]
            .chunks_exact(3)
            .map(|rgb| Rgb::new(rgb[0], rgb[1], rgb[2]))
            .collect();

        Ok(Self {
            rows,
            columns,
            frames,
            created,
            updated,
            pixels,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedUpdate {
    /// Applied in order: clear, fill, individual pixels.
    Patch {
        clear: bool,
        fill: Option<Rgb>,
        pixels: Vec<(u64, Rgb)>,
    },
    Frame(LedFrame),
}

impl LedUpdate {
    /// `Ok(None)` for an empty body.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Result<Option<Self>, UpdateError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let media_type = content_type
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .unwrap_or_default();
        if media_type.eq_ignore_ascii_case(OCTET_STREAM) {
            return LedFrame::decode(body).map(|frame| Some(Self::Frame(frame)));
        }

        let patch: PatchBody = serde_json::from_slice(body)
            .map_err(|err| UpdateError::Malformed(err.to_string()))?;

        let fill = patch.fill.map(color_from_components).transpose()?;
        let pixels = patch
            .pixels
            .into_iter()
            .map(|pixel| Ok((pixel.index, color_from_components(pixel.color)?)))
            .collect::<Result<Vec<_>, UpdateError>>()?;

        Ok(Some(Self::Patch {
            clear: patch.clear,
            fill,
            pixels,
        }))
    }

    fn validate(&self, len: usize) -> Result<(), UpdateError> {
        match self {
            Self::Patch { pixels, .. } => {
                if let Some((index, _)) = pixels.iter().find(|(index, _)| *index >= len as u64) {
                    return Err(UpdateError::IndexOutOfRange { index: *index, len });
                }
            }
            Self::Frame(frame) => {
                if frame.pixels.len() > len {
                    return Err(UpdateError::FrameTooLarge {
                        pixels: frame.pixels.len(),
                        len,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedSnapshot {
    pub revision: u64,
    pub pixels: Vec<Rgb>,
}

#[derive(Debug)]
struct StripBuffer {
    pixels: Vec<Rgb>,
    revision: u64,
}

/// Shared per-pixel buffer. Updates are validated up front and written under a
/// single lock acquisition, so readers never see a partial update.
#[derive(Debug)]
pub struct DeviceState {
    buffer: Mutex<StripBuffer>,
    len: usize,
}

impl DeviceState {
    pub fn new(num_leds: usize) -> Self {
        Self {
            buffer: Mutex::new(StripBuffer {
                pixels: vec![Rgb::OFF; num_leds],
                revision: 0,
            }),
            len: num_leds,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the new revision.
    pub fn apply(&self, update: &LedUpdate) -> Result<u64, UpdateError> {
        update.validate(self.len)?;

        let mut buffer = self.lock();
        match update {
            LedUpdate::Patch {
                clear,
                fill,
                pixels,
            } => {
                if *clear {
                    buffer.pixels.fill(Rgb::OFF);
                }
                if let Some(color) = fill {
                    buffer.pixels.fill(*color);
                }
                for (index, color) in pixels {
                    buffer.pixels[*index as usize] = *color;
                }
            }
            LedUpdate::Frame(frame) => {
                buffer.pixels[..frame.pixels.len()].copy_from_slice(&frame.pixels);
            }
        }
        buffer.revision += 1;
        Ok(buffer.revision)
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    pub fn snapshot(&self) -> LedSnapshot {
        let mut snapshot = LedSnapshot::default();
        self.copy_into(&mut snapshot);
        snapshot
    }

    /// Refreshes `out` in place, reusing its allocation.
    pub fn copy_into(&self, out: &mut LedSnapshot) {
        let buffer = self.lock();
        out.revision = buffer.revision;
        out.pixels.clear();
        out.pixels.extend_from_slice(&buffer.pixels);
    }

    fn lock(&self) -> MutexGuard<'_, StripBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    fn frame_file(rows: u8, columns: u8, frames: u8) -> Vec<u8> {
        let mut bytes = vec![FRAME_FILE_VERSION, rows, columns, frames];
        bytes.extend_from_slice(&1_700_000_000_u32.to_be_bytes());
        bytes.extend_from_slice(&1_700_000_100_u32.to_be_bytes());
        for i in 0..(rows as usize * columns as usize * frames as usize) {
            bytes.extend_from_slice(&[i as u8, 0x10, 0x20]);
        }
        bytes
    }

    #[test]
    fn empty_body_is_a_no_op() {
        assert_eq!(LedUpdate::parse(None, b""), Ok(None));
        assert_eq!(LedUpdate::parse(Some("application/json"), b"  \n"), Ok(None));
    }

    #[test]
    fn json_patch_applies_clear_fill_then_pixels() {
        let state = DeviceState::new(4);
        let update = LedUpdate::parse(
            Some("application/json"),
            br#"{"clear":true,"fill":[1,2,3],"pixels":[{"index":3,"color":[255,0,0]}]}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(state.apply(&update), Ok(1));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(
            snapshot.pixels,
            vec![
                Rgb::new(1, 2, 3),
                Rgb::new(1, 2, 3),
                Rgb::new(1, 2, 3),
                Rgb::new(255, 0, 0)
            ]
        );
    }

    #[test]
    fn out_of_range_values_are_rejected_without_mutation() {
        let state = DeviceState::new(4);

        assert_eq!(
            LedUpdate::parse(None, br#"{"fill":[256,0,0]}"#),
            Err(UpdateError::ComponentOutOfRange(256))
        );
        assert_eq!(
            LedUpdate::parse(None, br#"{"pixels":[{"index":0,"color":[-1,0,0]}]}"#),
            Err(UpdateError::ComponentOutOfRange(-1))
        );

        let update = LedUpdate::parse(
            None,
            br#"{"fill":[9,9,9],"pixels":[{"index":4,"color":[1,1,1]}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            state.apply(&update),
            Err(UpdateError::IndexOutOfRange { index: 4, len: 4 })
        );
        assert_eq!(state.snapshot(), LedSnapshot {
            revision: 0,
            pixels: vec![Rgb::OFF; 4]
        });
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            LedUpdate::parse(None, b"{not json"),
            Err(UpdateError::Malformed(_))
        ));
        assert!(matches!(
            LedUpdate::parse(None, br#"{"brightness":3}"#),
            Err(UpdateError::Malformed(_))
        ));
    }

    #[test]
    fn frame_file_applies_first_frame_row_major() {
        let state = DeviceState::new(8);
        let bytes = frame_file(2, 3, 2);

        let update = LedUpdate::parse(Some("application/octet-stream"), &bytes)
            .unwrap()
            .unwrap();
        let LedUpdate::Frame(frame) = &update else {
            panic!("expected frame update");
        };
        assert_eq!(frame.created, 1_700_000_000);
        assert_eq!(frame.pixels.len(), 6);

        state.apply(&update).unwrap();
        let pixels = state.snapshot().pixels;
        assert_eq!(pixels[0], Rgb::new(0, 0x10, 0x20));
        assert_eq!(pixels[5], Rgb::new(5, 0x10, 0x20));
        assert_eq!(pixels[6], Rgb::OFF);
    }

    #[test]
    fn frame_file_errors() {
        let mut bytes = frame_file(2, 2, 1);
        bytes[0] = 2;
        assert_eq!(LedFrame::decode(&bytes), Err(UpdateError::UnsupportedVersion(2)));

        let bytes = frame_file(2, 2, 1);
        assert_eq!(
            LedFrame::decode(&bytes[..20]),
            Err(UpdateError::Truncated {
                expected: 24,
                actual: 20
            })
        );

        let state = DeviceState::new(3);
        let update = LedUpdate::Frame(LedFrame::decode(&bytes).unwrap());
        assert_eq!(
            state.apply(&update),
            Err(UpdateError::FrameTooLarge { pixels: 4, len: 3 })
        );
    }

    #[test]
    fn concurrent_writers_never_tear_a_frame() {
        let state = Arc::new(DeviceState::new(256));
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = [Rgb::new(255, 0, 0), Rgb::new(0, 0, 255)]
            .into_iter()
            .map(|color| {
                let state = state.clone();
                thread::spawn(move || {
                    let update = LedUpdate::Patch {
                        clear: false,
                        fill: Some(color),
                        pixels: Vec::new(),
                    };
                    for _ in 0..500 {
                        state.apply(&update).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let state = state.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut snapshot = LedSnapshot::default();
                while !done.load(Ordering::Acquire) {
                    state.copy_into(&mut snapshot);
                    let first = snapshot.pixels[0];
                    assert!(snapshot.pixels.iter().all(|pixel| *pixel == first));
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
        reader.join().unwrap();

        assert_eq!(state.revision(), 1_000);
    }
}
