//! Producer-side payloads handed to the registry.

use bytes::Bytes;

use crate::error::TransferError;
use crate::transfer::{TransferKind, IMAGE_DEPTH};

/// A finished buffer ready to be chunked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub kind: TransferKind,
    pub bytes: Bytes,
}

impl Payload {
    pub fn generic(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: TransferKind::Generic,
            bytes: bytes.into(),
        }
    }

    /// Raw RGBA pixels, `width * height * 4` bytes.
    pub fn image(width: i32, height: i32, rgba: impl Into<Bytes>) -> Result<Self, TransferError> {
        let rgba = rgba.into();
        let expected = usize::try_from(width)
            .ok()
            .zip(usize::try_from(height).ok())
            .and_then(|(w, h)| w.checked_mul(h))
            .and_then(|px| px.checked_mul(IMAGE_DEPTH));

        if expected != Some(rgba.len()) {
            return Err(TransferError::ImageSizeMismatch {
                width,
                height,
                expected: expected.unwrap_or(0),
                actual: rgba.len(),
            });
        }
        Ok(Self {
            kind: TransferKind::Image { width, height },
            bytes: rgba,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Something that can produce a payload on demand: a renderer, a structure
/// snapshot. `None` means there is nothing to send right now.
pub trait PayloadSource {
    fn produce(&self) -> Option<Payload>;
}

impl<F> PayloadSource for F
where
    F: Fn() -> Option<Payload>,
{
    fn produce(&self) -> Option<Payload> {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_is_checked() {
        let ok = Payload::image(4, 2, vec![0u8; 32]).unwrap();
        assert_eq!(ok.kind, TransferKind::Image { width: 4, height: 2 });

        assert!(matches!(
            Payload::image(4, 2, vec![0u8; 31]),
            Err(TransferError::ImageSizeMismatch { expected: 32, actual: 31, .. })
        ));
        assert!(Payload::image(-1, 2, vec![0u8; 8]).is_err());
    }

    #[test]
    fn closures_are_sources() {
        let source = || Some(Payload::generic(&b"{}"[..]));
        assert_eq!(source.produce().unwrap().len(), 2);
    }
}
