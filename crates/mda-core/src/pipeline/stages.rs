//! Built-in processing stages.

use super::{ImageProcessor, Produced};
use crate::image::{tags, PixelType, TagValue, TaggedImage};
use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// Forwards every image unchanged.
#[derive(Debug, Clone)]
pub struct PassThrough {
    name: String,
    seen: u64,
}

impl PassThrough {
    /// Named pass-through stage.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seen: 0,
        }
    }

    /// Images seen since the last reset.
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

impl ImageProcessor for PassThrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, image: &TaggedImage, out: &mut Produced) -> Result<()> {
        self.seen += 1;
        out.produce(image.clone());
        Ok(())
    }

    fn reset(&mut self) {
        self.seen = 0;
    }
}

/// Adds a fixed tag to every image.
#[derive(Debug, Clone)]
pub struct TagAnnotator {
    key: String,
    value: TagValue,
}

impl TagAnnotator {
    /// Stage that sets `key` to `value`.
    pub fn new(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl ImageProcessor for TagAnnotator {
    fn name(&self) -> &str {
        "tag-annotator"
    }

    fn process(&mut self, image: &TaggedImage, out: &mut Produced) -> Result<()> {
        out.produce(image.clone().with_tag(self.key.clone(), self.value.clone()));
        Ok(())
    }
}

/// Splits a side-by-side dual-view frame into two channel images.
///
/// The left half keeps channel `2c` and the right half becomes channel `2c + 1`,
/// where `c` is the incoming channel index. Odd widths are rejected.
#[derive(Debug, Clone, Default)]
pub struct ChannelSplitter;

impl ChannelSplitter {
    /// New splitter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ImageProcessor for ChannelSplitter {
    fn name(&self) -> &str {
        "channel-splitter"
    }

    fn process(&mut self, image: &TaggedImage, out: &mut Produced) -> Result<()> {
        let width = image.width();
        if width % 2 != 0 {
            bail!("cannot split odd width {width}");
        }
        let bpp = image.pixel_type().bytes_per_pixel();
        let row = width as usize * bpp;
        let half = row / 2;
        let mut left = Vec::with_capacity(image.byte_len() / 2);
        let mut right = Vec::with_capacity(image.byte_len() / 2);
        for chunk in image.pixels().chunks_exact(row) {
            left.extend_from_slice(&chunk[..half]);
            right.extend_from_slice(&chunk[half..]);
        }

        let channel = image.channel_index().unwrap_or(0);
        let name = image
            .tags()
            .get(tags::CHANNEL)
            .map(ToString::to_string)
            .unwrap_or_default();
        let left = image
            .with_pixels(width / 2, image.height(), left)?
            .with_tag(tags::CHANNEL_INDEX, channel * 2)
            .with_tag(tags::CHANNEL, format!("{name}-left"));
        let right = image
            .with_pixels(width / 2, image.height(), right)?
            .with_tag(tags::CHANNEL_INDEX, channel * 2 + 1)
            .with_tag(tags::CHANNEL, format!("{name}-right"));
        out.produce(left);
        out.produce(right);
        Ok(())
    }
}

struct Accumulator {
    template: TaggedImage,
    sums: Vec<u64>,
    count: usize,
}

impl Accumulator {
    fn new(image: &TaggedImage) -> Self {
        Self {
            template: image.clone(),
            sums: vec![0; image.width() as usize * image.height() as usize],
            count: 0,
        }
    }

    fn add(&mut self, image: &TaggedImage) -> Result<()> {
        if image.width() != self.template.width()
            || image.height() != self.template.height()
            || image.pixel_type() != self.template.pixel_type()
        {
            bail!("frame geometry changed mid-average");
        }
        match image.pixel_type() {
            PixelType::Gray8 => {
                for (sum, &p) in self.sums.iter_mut().zip(image.pixels().iter()) {
                    *sum += u64::from(p);
                }
            }
            PixelType::Gray16 => {
                for (sum, p) in self.sums.iter_mut().zip(image.pixels_u16()) {
                    *sum += u64::from(p);
                }
            }
        }
        self.count += 1;
        Ok(())
    }

    fn finish(self) -> Result<TaggedImage> {
        let n = u64::try_from(self.count.max(1))?;
        let t = &self.template;
        let averaged = match t.pixel_type() {
            PixelType::Gray8 => {
                let pixels: Vec<u8> = self
                    .sums
                    .iter()
                    .map(|s| u8::try_from(s / n).unwrap_or(u8::MAX))
                    .collect();
                t.with_pixels(t.width(), t.height(), pixels)?
            }
            PixelType::Gray16 => {
                let pixels: Vec<u8> = self
                    .sums
                    .iter()
                    .flat_map(|s| u16::try_from(s / n).unwrap_or(u16::MAX).to_le_bytes())
                    .collect();
                t.with_pixels(t.width(), t.height(), pixels)?
            }
        };
        Ok(averaged.with_tag("AveragedFrames", self.count))
    }
}

/// Averages every `count` consecutive frames of the same channel and position.
///
/// Incomplete groups are emitted as partial averages on flush.
pub struct FrameAverager {
    count: usize,
    pending: BTreeMap<(Option<usize>, Option<usize>), Accumulator>,
}

impl FrameAverager {
    /// Averages groups of `count` frames (at least 1).
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
            pending: BTreeMap::new(),
        }
    }

    /// Groups currently held.
    #[must_use]
    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }
}

impl ImageProcessor for FrameAverager {
    fn name(&self) -> &str {
        "frame-averager"
    }

    fn process(&mut self, image: &TaggedImage, out: &mut Produced) -> Result<()> {
        let key = (image.channel_index(), image.position_index());
        let acc = self
            .pending
            .entry(key)
            .or_insert_with(|| Accumulator::new(image));
        acc.add(image)?;
        if acc.count >= self.count {
            if let Some(acc) = self.pending.remove(&key) {
                out.produce(acc.finish()?);
            }
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Produced) -> Result<()> {
        for (_, acc) in std::mem::take(&mut self.pending) {
            out.produce(acc.finish()?);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.pending.clear();
    }
}
