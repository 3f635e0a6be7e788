//! Image sink that reports progress through `tracing`.

use anyhow::Result;
use async_trait::async_trait;
use mda_core::image::{tags, TaggedImage};
use mda_core::sink::ImageSink;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Logs every delivered image at `debug` and a progress line every
/// `report_every` images.
#[derive(Debug)]
pub struct LoggingSink {
    report_every: u64,
    images: u64,
    bytes: u64,
    per_channel: BTreeMap<String, u64>,
}

impl LoggingSink {
    /// Sink that reports progress every `report_every` images (at least 1).
    pub fn new(report_every: u64) -> Self {
        Self {
            report_every: report_every.max(1),
            images: 0,
            bytes: 0,
            per_channel: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl ImageSink for LoggingSink {
    async fn on_image_ready(&mut self, image: TaggedImage) -> Result<()> {
        self.images += 1;
        self.bytes += image.byte_len() as u64;
        let channel = image
            .tags()
            .get(tags::CHANNEL)
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();
        *self.per_channel.entry(channel.clone()).or_default() += 1;

        debug!(
            sequence = image.sequence(),
            time = image.frame_index(),
            position = image.position_index(),
            channel = %channel,
            slice = image.slice_index(),
            "Image delivered"
        );
        if self.images % self.report_every == 0 {
            info!(images = self.images, mib = self.bytes / (1 << 20), "Progress");
        }
        Ok(())
    }

    async fn on_timepoint_finished(&mut self, time: usize) -> Result<()> {
        info!(time, images = self.images, "Time point finished");
        Ok(())
    }

    async fn on_acquisition_finished(&mut self) -> Result<()> {
        info!(
            images = self.images,
            channels = ?self.per_channel,
            "All images delivered"
        );
        Ok(())
    }
}
