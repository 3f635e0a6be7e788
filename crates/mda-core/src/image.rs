//! Tagged images and the packets that carry them between stages.
//!
//! A [`TaggedImage`] owns its pixel bytes (`bytes::Bytes`, so forwarding an
//! unchanged image never copies) and an ordered tag map. Images travel through
//! the pipeline wrapped in a [`Packet`], which also carries phase-boundary
//! signals and the shutdown sentinel.

use crate::error::{AcqError, AcqResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known tag keys written by the engine and the capture source.
pub mod tags {
    /// Time point index.
    pub const FRAME_INDEX: &str = "FrameIndex";
    /// Enabled-channel index.
    pub const CHANNEL_INDEX: &str = "ChannelIndex";
    /// Slice index.
    pub const SLICE_INDEX: &str = "SliceIndex";
    /// Stage position index.
    pub const POSITION_INDEX: &str = "PositionIndex";
    /// Channel display name.
    pub const CHANNEL: &str = "Channel";
    /// Stage position label.
    pub const POSITION_NAME: &str = "PositionName";
    /// Image width in pixels.
    pub const WIDTH: &str = "Width";
    /// Image height in pixels.
    pub const HEIGHT: &str = "Height";
    /// `GRAY8` or `GRAY16`.
    pub const PIXEL_TYPE: &str = "PixelType";
    /// Camera that produced the image.
    pub const CAMERA: &str = "Camera";
    /// Target Z position in micrometres.
    pub const Z_UM: &str = "ZPositionUm";
    /// Target X position in micrometres.
    pub const X_UM: &str = "XPositionUm";
    /// Target Y position in micrometres.
    pub const Y_UM: &str = "YPositionUm";
    /// Milliseconds since the run started.
    pub const ELAPSED_MS: &str = "ElapsedTime-ms";
    /// Exposure used for the capture.
    pub const EXPOSURE_MS: &str = "Exposure-ms";
}

/// Grayscale pixel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    /// One byte per pixel.
    #[serde(rename = "GRAY8")]
    Gray8,
    /// Two bytes per pixel, little-endian.
    #[serde(rename = "GRAY16")]
    Gray16,
}

impl PixelType {
    /// Bytes used by one pixel.
    #[must_use]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Gray8 => 1,
            Self::Gray16 => 2,
        }
    }

    /// Maps a byte depth back to a pixel type.
    pub fn from_bytes_per_pixel(bpp: usize) -> AcqResult<Self> {
        match bpp {
            1 => Ok(Self::Gray8),
            2 => Ok(Self::Gray16),
            other => Err(AcqError::InvalidImage(format!(
                "unsupported bytes per pixel: {other}"
            ))),
        }
    }

    /// Name used in the `PixelType` tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gray8 => "GRAY8",
            Self::Gray16 => "GRAY16",
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Boolean flag.
    Bool(bool),
    /// Free text.
    Text(String),
}

impl TagValue {
    /// Integer view, if this is an integer tag.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of integer or float tags.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view, if this is a text tag.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for TagValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for TagValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Ordered key/value metadata attached to an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageTags(BTreeMap<String, TagValue>);

impl ImageTags {
    /// Empty tag map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a tag.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Looks a tag up by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.0.get(key)
    }

    /// Integer tag as `usize`.
    #[must_use]
    pub fn get_index(&self, key: &str) -> Option<usize> {
        self.get(key)
            .and_then(TagValue::as_int)
            .and_then(|v| usize::try_from(v).ok())
    }

    /// Removes a tag.
    pub fn remove(&mut self, key: &str) -> Option<TagValue> {
        self.0.remove(key)
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no tags are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Tags in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A grayscale image with metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedImage {
    width: u32,
    height: u32,
    pixel_type: PixelType,
    pixels: Bytes,
    tags: ImageTags,
    sequence: Option<u64>,
}

impl TaggedImage {
    /// Creates an image, rejecting pixel buffers whose length does not match
    /// `width * height * bytes_per_pixel`.
    ///
    /// Geometry tags (`Width`, `Height`, `PixelType`) are filled in.
    pub fn new(
        width: u32,
        height: u32,
        pixel_type: PixelType,
        pixels: impl Into<Bytes>,
    ) -> AcqResult<Self> {
        let pixels = pixels.into();
        let expected = Self::expected_len(width, height, pixel_type);
        if pixels.len() != expected {
            return Err(AcqError::InvalidImage(format!(
                "{width}x{height} {pixel_type} needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        let mut tags = ImageTags::new();
        tags.insert(tags::WIDTH, width);
        tags.insert(tags::HEIGHT, height);
        tags.insert(tags::PIXEL_TYPE, pixel_type.as_str());
        Ok(Self {
            width,
            height,
            pixel_type,
            pixels,
            tags,
            sequence: None,
        })
    }

    /// Creates a 16-bit image from pixel values (little-endian on the wire).
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> AcqResult<Self> {
        let bytes: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
        Self::new(width, height, PixelType::Gray16, bytes)
    }

    /// Byte length for a given geometry.
    #[must_use]
    pub fn expected_len(width: u32, height: u32, pixel_type: PixelType) -> usize {
        width as usize * height as usize * pixel_type.bytes_per_pixel()
    }

    /// Image width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format.
    #[must_use]
    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    /// Raw pixel bytes.
    #[must_use]
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// Byte length of the pixel buffer.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// 16-bit pixel values. Empty for 8-bit images.
    #[must_use]
    pub fn pixels_u16(&self) -> Vec<u16> {
        match self.pixel_type {
            PixelType::Gray16 => self
                .pixels
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
            PixelType::Gray8 => Vec::new(),
        }
    }

    /// Metadata tags.
    #[must_use]
    pub fn tags(&self) -> &ImageTags {
        &self.tags
    }

    /// Mutable metadata tags.
    pub fn tags_mut(&mut self) -> &mut ImageTags {
        &mut self.tags
    }

    /// Builder-style tag insertion.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key, value);
        self
    }

    /// Buffer sequence number, assigned when the image is pushed.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Records the buffer sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    /// Enabled-channel index tag.
    #[must_use]
    pub fn channel_index(&self) -> Option<usize> {
        self.tags.get_index(tags::CHANNEL_INDEX)
    }

    /// Slice index tag.
    #[must_use]
    pub fn slice_index(&self) -> Option<usize> {
        self.tags.get_index(tags::SLICE_INDEX)
    }

    /// Time point tag.
    #[must_use]
    pub fn frame_index(&self) -> Option<usize> {
        self.tags.get_index(tags::FRAME_INDEX)
    }

    /// Position index tag.
    #[must_use]
    pub fn position_index(&self) -> Option<usize> {
        self.tags.get_index(tags::POSITION_INDEX)
    }

    /// Replaces the pixel buffer and geometry, keeping tags.
    ///
    /// Used by stages that crop or split images. Geometry tags are updated.
    pub fn with_pixels(
        &self,
        width: u32,
        height: u32,
        pixels: impl Into<Bytes>,
    ) -> AcqResult<Self> {
        let mut image = Self::new(width, height, self.pixel_type, pixels)?;
        for (key, value) in self.tags.iter() {
            if key != tags::WIDTH && key != tags::HEIGHT {
                image.tags.insert(key, value.clone());
            }
        }
        image.sequence = self.sequence;
        Ok(image)
    }
}

/// Phase-boundary markers that travel in order with images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionSignal {
    /// Every capture of this time point has been pushed.
    TimepointFinished {
        /// Finished time point.
        time: usize,
    },
    /// The run is over; no more images follow.
    AcquisitionFinished,
}

/// Unit of work moving through the processing pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A captured or derived image.
    Image(TaggedImage),
    /// A non-data marker forwarded untouched by every stage.
    Signal(AcquisitionSignal),
    /// End of stream. Forwarded exactly once per stage; nothing follows it.
    Shutdown,
}

impl Packet {
    /// True for the shutdown sentinel.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Image payload, if any.
    #[must_use]
    pub fn as_image(&self) -> Option<&TaggedImage> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_mismatched_pixel_length() {
        let err = TaggedImage::new(4, 4, PixelType::Gray16, vec![0u8; 31]).unwrap_err();
        assert!(matches!(err, AcqError::InvalidImage(_)));
        assert!(TaggedImage::new(4, 4, PixelType::Gray16, vec![0u8; 32]).is_ok());
        assert!(TaggedImage::new(4, 4, PixelType::Gray8, vec![0u8; 16]).is_ok());
    }

    #[test]
    fn geometry_tags_are_filled_in() {
        let image = TaggedImage::new(3, 2, PixelType::Gray8, vec![0u8; 6]).unwrap();
        assert_eq!(image.tags().get_index(tags::WIDTH), Some(3));
        assert_eq!(image.tags().get_index(tags::HEIGHT), Some(2));
        assert_eq!(
            image.tags().get(tags::PIXEL_TYPE).and_then(TagValue::as_str),
            Some("GRAY8")
        );
    }

    #[test]
    fn u16_pixels_are_little_endian() {
        let image = TaggedImage::from_u16(2, 1, &[0x0102, 0xA0B0]).unwrap();
        assert_eq!(image.pixels().as_ref(), &[0x02, 0x01, 0xB0, 0xA0]);
        assert_eq!(image.pixels_u16(), vec![0x0102, 0xA0B0]);
    }

    #[test]
    fn with_pixels_keeps_coordinates() {
        let image = TaggedImage::new(4, 1, PixelType::Gray8, vec![1u8, 2, 3, 4])
            .unwrap()
            .with_tag(tags::CHANNEL_INDEX, 1usize)
            .with_tag(tags::CHANNEL, "FITC");
        let half = image.with_pixels(2, 1, vec![1u8, 2]).unwrap();
        assert_eq!(half.width(), 2);
        assert_eq!(half.tags().get_index(tags::WIDTH), Some(2));
        assert_eq!(half.channel_index(), Some(1));
        assert_eq!(
            half.tags().get(tags::CHANNEL).and_then(TagValue::as_str),
            Some("FITC")
        );
    }
}
