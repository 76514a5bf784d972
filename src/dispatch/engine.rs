//! Group accumulation and capability dispatch
//!
//! The engine consumes the inbound message sequence one record at a time,
//! buffers records into per-kind groups, evaluates the capability's trigger
//! and grouping rules, and forwards handler results outbound before the next
//! inbound message is consumed. At most one capability invocation is ever in
//! flight.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use mrd::{
    Acquisition, Image, InboundChannel, LogLevel, MrdError, OutboundChannel, Result,
    StreamMessage, Waveform,
};

use crate::capability::{Capability, ResolvedCapability, Settings};
use crate::dispatch::grouping::{GroupingKey, GroupingMask};

/// Per-kind record accounting for one session
///
/// For acquisitions and images, every record seen is either processed
/// (appended to a group that is eventually flushed), ignored (kind disabled
/// by the capability) or wrong-typed (dropped by flag or type selection).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    pub acquisitions_seen: u64,
    pub acquisitions_processed: u64,
    pub acquisitions_ignored: u64,
    pub acquisitions_wrongtype: u64,
    pub images_seen: u64,
    pub images_processed: u64,
    pub images_ignored: u64,
    pub images_wrongtype: u64,
    pub waveforms_seen: u64,
    pub waveforms_retained: u64,
    pub waveforms_ignored: u64,
}

/// Dispatch state machine for one streaming session
///
/// Owns the group buffers and the session's grouping mask; the mask is fixed
/// at construction from the resolved capability's settings and never shared
/// outside this engine.
pub struct DispatchEngine {
    capability_name: String,
    capability: Arc<dyn Capability>,
    settings: Settings,
    mask: GroupingMask,
    metadata: String,

    acquisition_group: Vec<Acquisition>,
    acquisition_index: usize,
    image_group: Vec<Image>,
    image_index: usize,
    image_key: Option<GroupingKey>,
    waveform_group: Vec<Waveform>,

    counters: DispatchCounters,
}

impl DispatchEngine {
    /// Build an engine for one session from a resolved capability
    pub fn new(resolved: ResolvedCapability, metadata: impl Into<String>) -> Self {
        let settings = resolved.capability.settings();
        let mask = settings.grouping_mask();
        debug!(
            "Dispatch settings for capability '{}': {:?}",
            resolved.name, settings
        );
        Self {
            capability_name: resolved.name,
            capability: resolved.capability,
            settings,
            mask,
            metadata: metadata.into(),
            acquisition_group: Vec::new(),
            acquisition_index: 0,
            image_group: Vec::new(),
            image_index: 0,
            image_key: None,
            waveform_group: Vec::new(),
            counters: DispatchCounters::default(),
        }
    }

    pub fn counters(&self) -> DispatchCounters {
        self.counters
    }

    /// Waveform records retained for the session (never flushed to a handler)
    pub fn retained_waveforms(&self) -> &[Waveform] {
        &self.waveform_group
    }

    /// Drive the session to completion
    ///
    /// Protocol, transport and capability errors end the read loop but are
    /// contained here: they are logged, reported outbound as an ERROR
    /// logging frame, and the termination path still flushes remaining
    /// groups. A Close frame is sent on every exit path.
    pub async fn run(
        &mut self,
        inbound: &mut dyn InboundChannel,
        outbound: &mut dyn OutboundChannel,
    ) -> DispatchCounters {
        if let Err(e) = self.consume_stream(inbound, outbound).await {
            error!("Session ended abnormally: {}", error_chain(&e));
            let report = format!("Session ended abnormally: {}", error_chain(&e));
            if let Err(send_err) = outbound.send_logging(LogLevel::Error, &report).await {
                warn!("Could not report session error to peer: {}", send_err);
            }
        }

        self.terminate(outbound).await;

        if let Err(e) = outbound.send_close().await {
            error!("Failed to send close message: {}", e);
        }
        self.counters
    }

    async fn consume_stream(
        &mut self,
        inbound: &mut dyn InboundChannel,
        outbound: &mut dyn OutboundChannel,
    ) -> Result<()> {
        loop {
            let message = match inbound.next_message().await? {
                Some(message) => message,
                None => {
                    debug!("Transport reached end of stream");
                    return Ok(());
                }
            };

            match message {
                StreamMessage::Acquisition(acquisition) => {
                    self.on_acquisition(acquisition, outbound).await?
                }
                StreamMessage::Image(image) => self.on_image(image, outbound).await?,
                StreamMessage::Waveform(waveform) => self.on_waveform(waveform),
                StreamMessage::Close => {
                    debug!("Close received");
                    return Ok(());
                }
                other => {
                    return Err(MrdError::protocol(format!(
                        "Unsupported {} message during data streaming",
                        other.kind_name()
                    )));
                }
            }
        }
    }

    async fn on_acquisition(
        &mut self,
        acquisition: Acquisition,
        outbound: &mut dyn OutboundChannel,
    ) -> Result<()> {
        self.counters.acquisitions_seen += 1;

        if !self.settings.keep_acquisition {
            self.counters.acquisitions_ignored += 1;
            return Ok(());
        }
        if acquisition
            .header
            .has_any_flag(&self.settings.acquisition_ignore)
        {
            self.counters.acquisitions_wrongtype += 1;
            return Ok(());
        }

        let triggered = acquisition
            .header
            .has_any_flag(&self.settings.acquisition_trigger);
        self.acquisition_group.push(acquisition);

        if triggered {
            self.flush_acquisitions(outbound, "explicitly triggered")
                .await?;
        }
        Ok(())
    }

    async fn on_image(
        &mut self,
        image: Image,
        outbound: &mut dyn OutboundChannel,
    ) -> Result<()> {
        self.counters.images_seen += 1;

        if !self.settings.keep_image {
            self.counters.images_ignored += 1;
            return Ok(());
        }
        if !self.settings.image_select.contains(&image.header.image_type) {
            self.counters.images_wrongtype += 1;
            return Ok(());
        }

        let key = GroupingKey::from_header(&image.header);
        match self.image_key {
            None => self.image_key = Some(key),
            Some(current) => {
                let changed = key.differs_from(&current, &self.mask);
                if !changed.is_empty() {
                    let fields: Vec<&str> =
                        changed.iter().map(|field| field.name()).collect();
                    info!(
                        "Processing an image group due to change in: {}",
                        fields.join(", ")
                    );
                    self.flush_images(outbound).await?;
                    self.image_key = Some(key);
                }
            }
        }
        // Append after the flush decision so a triggering image starts the
        // new group
        self.image_group.push(image);
        Ok(())
    }

    fn on_waveform(&mut self, waveform: Waveform) {
        self.counters.waveforms_seen += 1;
        if self.settings.keep_waveform {
            self.counters.waveforms_retained += 1;
            self.waveform_group.push(waveform);
        } else {
            self.counters.waveforms_ignored += 1;
        }
    }

    async fn flush_acquisitions(
        &mut self,
        outbound: &mut dyn OutboundChannel,
        reason: &str,
    ) -> Result<()> {
        if self.acquisition_group.is_empty() {
            return Ok(());
        }
        info!(
            "Processing a group of {} k-space readouts ({})",
            self.acquisition_group.len(),
            reason
        );

        let images = self
            .capability
            .process_acquisition(
                &self.acquisition_group,
                self.acquisition_index,
                outbound,
                &self.metadata,
            )
            .await
            .map_err(|e| MrdError::capability(&self.capability_name, e))?;

        for image in &images {
            outbound.send_image(image).await?;
        }

        self.counters.acquisitions_processed += self.acquisition_group.len() as u64;
        self.acquisition_group.clear();
        self.acquisition_index += 1;
        Ok(())
    }

    async fn flush_images(&mut self, outbound: &mut dyn OutboundChannel) -> Result<()> {
        if self.image_group.is_empty() {
            return Ok(());
        }

        let images = self
            .capability
            .process_image(
                &self.image_group,
                self.image_index,
                outbound,
                &self.metadata,
            )
            .await
            .map_err(|e| MrdError::capability(&self.capability_name, e))?;

        for image in &images {
            outbound.send_image(image).await?;
        }

        self.counters.images_processed += self.image_group.len() as u64;
        self.image_group.clear();
        self.image_index += 1;
        Ok(())
    }

    /// Flush whatever is still buffered and report counter summaries
    ///
    /// Both flushes are attempted independently: a failing handler must not
    /// keep the other kind, or the summaries, from going out.
    async fn terminate(&mut self, outbound: &mut dyn OutboundChannel) {
        if !self.acquisition_group.is_empty() {
            if let Err(e) = self
                .flush_acquisitions(outbound, "end of data stream")
                .await
            {
                error!(
                    "Final acquisition flush failed: {:#}",
                    error_chain(&e)
                );
                let _ = outbound
                    .send_logging(
                        LogLevel::Error,
                        &format!("Final acquisition flush failed: {}", error_chain(&e)),
                    )
                    .await;
            }
        }

        if !self.image_group.is_empty() {
            info!("Processing a group of images (end of data stream)");
            if let Err(e) = self.flush_images(outbound).await {
                error!("Final image flush failed: {}", error_chain(&e));
                let _ = outbound
                    .send_logging(
                        LogLevel::Error,
                        &format!("Final image flush failed: {}", error_chain(&e)),
                    )
                    .await;
            }
        }

        let summaries = [
            (self.counters.acquisitions_ignored, "acquisition records"),
            (
                self.counters.acquisitions_wrongtype,
                "acquisition records of ignored types",
            ),
            (self.counters.images_ignored, "image records"),
            (
                self.counters.images_wrongtype,
                "image records of incompatible types",
            ),
            (self.counters.waveforms_ignored, "waveform records"),
        ];
        for (count, description) in summaries {
            if count > 0 {
                let text = format!(
                    "Received {} instances of {}, which were ignored by this analysis",
                    count, description
                );
                warn!("{}", text);
                if let Err(e) = outbound.send_logging(LogLevel::Info, &text).await {
                    warn!("Could not send counter summary: {}", e);
                }
            }
        }
    }
}

fn error_chain(error: &MrdError) -> String {
    use std::error::Error;
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mrd::{AcquisitionFlag, AcquisitionHeader, ImageHeader, ImageType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::capability::CapabilityRegistry;
    use crate::dispatch::grouping::IndexField;

    /// Inbound channel backed by a fixed message list
    struct ScriptedInbound {
        messages: std::vec::IntoIter<Result<Option<StreamMessage>>>,
    }

    impl ScriptedInbound {
        fn new(messages: Vec<StreamMessage>) -> Self {
            let mut scripted: Vec<Result<Option<StreamMessage>>> =
                messages.into_iter().map(|m| Ok(Some(m))).collect();
            scripted.push(Ok(None));
            Self {
                messages: scripted.into_iter(),
            }
        }

        fn with_tail_error(messages: Vec<StreamMessage>, error: MrdError) -> Self {
            let mut scripted: Vec<Result<Option<StreamMessage>>> =
                messages.into_iter().map(|m| Ok(Some(m))).collect();
            scripted.push(Err(error));
            Self {
                messages: scripted.into_iter(),
            }
        }
    }

    #[async_trait]
    impl InboundChannel for ScriptedInbound {
        async fn next_message(&mut self) -> Result<Option<StreamMessage>> {
            self.messages.next().unwrap_or(Ok(None))
        }
    }

    /// Outbound channel recording every frame it was asked to write
    #[derive(Default)]
    struct RecordingOutbound {
        frames: Vec<StreamMessage>,
    }

    impl RecordingOutbound {
        fn close_count(&self) -> usize {
            self.frames
                .iter()
                .filter(|m| **m == StreamMessage::Close)
                .count()
        }

        fn sent_images(&self) -> Vec<&Image> {
            self.frames
                .iter()
                .filter_map(|m| match m {
                    StreamMessage::Image(image) => Some(image),
                    _ => None,
                })
                .collect()
        }

        fn error_logs(&self) -> Vec<&str> {
            self.frames
                .iter()
                .filter_map(|m| match m {
                    StreamMessage::Logging(LogLevel::Error, text) => Some(text.as_str()),
                    _ => None,
                })
                .collect()
        }

        fn info_logs(&self) -> Vec<&str> {
            self.frames
                .iter()
                .filter_map(|m| match m {
                    StreamMessage::Logging(LogLevel::Info, text) => Some(text.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl OutboundChannel for RecordingOutbound {
        async fn send_config_name(&mut self, name: &str) -> Result<()> {
            self.frames.push(StreamMessage::ConfigName(name.into()));
            Ok(())
        }
        async fn send_config_text(&mut self, text: &str) -> Result<()> {
            self.frames.push(StreamMessage::ConfigText(text.into()));
            Ok(())
        }
        async fn send_metadata(&mut self, metadata: &str) -> Result<()> {
            self.frames.push(StreamMessage::Metadata(metadata.into()));
            Ok(())
        }
        async fn send_text(&mut self, text: &str) -> Result<()> {
            self.frames.push(StreamMessage::Text(text.into()));
            Ok(())
        }
        async fn send_logging(&mut self, level: LogLevel, text: &str) -> Result<()> {
            self.frames.push(StreamMessage::Logging(level, text.into()));
            Ok(())
        }
        async fn send_acquisition(&mut self, acquisition: &Acquisition) -> Result<()> {
            self.frames
                .push(StreamMessage::Acquisition(acquisition.clone()));
            Ok(())
        }
        async fn send_image(&mut self, image: &Image) -> Result<()> {
            self.frames.push(StreamMessage::Image(image.clone()));
            Ok(())
        }
        async fn send_waveform(&mut self, waveform: &Waveform) -> Result<()> {
            self.frames.push(StreamMessage::Waveform(waveform.clone()));
            Ok(())
        }
        async fn send_close(&mut self) -> Result<()> {
            self.frames.push(StreamMessage::Close);
            Ok(())
        }
    }

    /// Capability that records invocations and echoes one marker image per
    /// flush
    struct Probe {
        settings: Settings,
        acquisition_calls: AtomicUsize,
        image_calls: AtomicUsize,
        group_sizes: std::sync::Mutex<Vec<(usize, usize)>>,
        fail: bool,
    }

    impl Probe {
        fn new(settings: Settings) -> Self {
            Self {
                settings,
                acquisition_calls: AtomicUsize::new(0),
                image_calls: AtomicUsize::new(0),
                group_sizes: std::sync::Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing(settings: Settings) -> Self {
            let mut probe = Self::new(settings);
            probe.fail = true;
            probe
        }

        fn keep_everything() -> Settings {
            Settings {
                keep_acquisition: true,
                keep_image: true,
                keep_waveform: true,
                acquisition_ignore: vec![AcquisitionFlag::IsNoiseMeasurement],
                acquisition_trigger: vec![AcquisitionFlag::LastInSlice],
                image_select: vec![ImageType::Magnitude],
                grouping_fields: vec![IndexField::Slice],
            }
        }

        fn marker_image(index: usize) -> Image {
            let mut header = ImageHeader::default();
            header.image_index = index as u16;
            Image::from_i16_pixels(header, 1, 1, &[7], "")
        }
    }

    #[async_trait]
    impl Capability for Probe {
        fn settings(&self) -> Settings {
            self.settings.clone()
        }

        async fn process_acquisition(
            &self,
            group: &[Acquisition],
            index: usize,
            _channel: &mut dyn OutboundChannel,
            _metadata: &str,
        ) -> anyhow::Result<Vec<Image>> {
            if self.fail {
                anyhow::bail!("probe acquisition failure");
            }
            self.acquisition_calls.fetch_add(1, Ordering::SeqCst);
            self.group_sizes.lock().unwrap().push((index, group.len()));
            Ok(vec![Self::marker_image(index)])
        }

        async fn process_image(
            &self,
            group: &[Image],
            index: usize,
            _channel: &mut dyn OutboundChannel,
            _metadata: &str,
        ) -> anyhow::Result<Vec<Image>> {
            if self.fail {
                anyhow::bail!("probe image failure");
            }
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            self.group_sizes.lock().unwrap().push((index, group.len()));
            Ok(vec![Self::marker_image(index)])
        }
    }

    fn engine_with(probe: Arc<Probe>) -> DispatchEngine {
        DispatchEngine::new(
            ResolvedCapability {
                name: "probe".into(),
                capability: probe,
            },
            "<study/>",
        )
    }

    fn acquisition(flags: &[AcquisitionFlag]) -> StreamMessage {
        let mut header = AcquisitionHeader {
            active_channels: 1,
            number_of_samples: 2,
            ..Default::default()
        };
        for flag in flags {
            header.set_flag(*flag);
        }
        StreamMessage::Acquisition(Acquisition::new(header, vec![0.0; 4]))
    }

    fn image(slice: u16, image_type: ImageType) -> StreamMessage {
        let header = ImageHeader {
            slice,
            image_type,
            ..Default::default()
        };
        StreamMessage::Image(Image::from_i16_pixels(header, 1, 1, &[1], ""))
    }

    // Scenario A: three untriggered acquisitions flush exactly once at end
    // of stream, as one group of three at index 0.
    #[tokio::test]
    async fn test_untriggered_acquisitions_flush_once_at_end() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound =
            ScriptedInbound::new(vec![acquisition(&[]), acquisition(&[]), acquisition(&[])]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(probe.acquisition_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*probe.group_sizes.lock().unwrap(), vec![(0, 3)]);
        assert_eq!(counters.acquisitions_seen, 3);
        assert_eq!(counters.acquisitions_processed, 3);
        assert_eq!(outbound.close_count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_flag_flushes_immediately() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound = ScriptedInbound::new(vec![
            acquisition(&[]),
            acquisition(&[AcquisitionFlag::LastInSlice]),
            acquisition(&[]),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        // One triggered flush of two, one end-of-stream flush of one
        assert_eq!(*probe.group_sizes.lock().unwrap(), vec![(0, 2), (1, 1)]);
        assert_eq!(counters.acquisitions_processed, 3);
        assert_eq!(outbound.sent_images().len(), 2);
        assert_eq!(outbound.close_count(), 1);
    }

    // Scenario B: images with slices [0, 0, 1] under a {slice} mask flush a
    // group of two at index 0, then the remaining one at index 1.
    #[tokio::test]
    async fn test_image_grouping_by_masked_field() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound = ScriptedInbound::new(vec![
            image(0, ImageType::Magnitude),
            image(0, ImageType::Magnitude),
            image(1, ImageType::Magnitude),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(probe.image_calls.load(Ordering::SeqCst), 2);
        assert_eq!(*probe.group_sizes.lock().unwrap(), vec![(0, 2), (1, 1)]);
        assert_eq!(counters.images_seen, 3);
        assert_eq!(counters.images_processed, 3);
        assert_eq!(outbound.close_count(), 1);
    }

    #[tokio::test]
    async fn test_identical_masked_fields_never_split_a_group() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        // Same slice throughout: one group regardless of how many images
        let mut inbound = ScriptedInbound::new(vec![
            image(4, ImageType::Magnitude),
            image(4, ImageType::Magnitude),
            image(4, ImageType::Magnitude),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(probe.image_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*probe.group_sizes.lock().unwrap(), vec![(0, 3)]);
    }

    // Scenario C: an acquisition carrying an ignored flag is counted as
    // wrong-typed, never appended, and never triggers a flush.
    #[tokio::test]
    async fn test_ignored_flag_counts_as_wrongtype() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound = ScriptedInbound::new(vec![
            acquisition(&[AcquisitionFlag::IsNoiseMeasurement]),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(counters.acquisitions_wrongtype, 1);
        assert_eq!(counters.acquisitions_ignored, 0);
        assert_eq!(counters.acquisitions_processed, 0);
        assert_eq!(probe.acquisition_calls.load(Ordering::SeqCst), 0);
        // The wrong-type counter is summarized outbound
        assert!(outbound
            .info_logs()
            .iter()
            .any(|text| text.contains("acquisition records of ignored types")));
    }

    #[tokio::test]
    async fn test_disabled_kinds_count_as_ignored() {
        let probe = Arc::new(Probe::new(Settings {
            keep_acquisition: false,
            keep_image: false,
            keep_waveform: false,
            acquisition_ignore: vec![],
            acquisition_trigger: vec![],
            image_select: vec![],
            grouping_fields: vec![],
        }));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound = ScriptedInbound::new(vec![
            acquisition(&[]),
            image(0, ImageType::Magnitude),
            StreamMessage::Waveform(Waveform::new(Default::default(), vec![])),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(counters.acquisitions_ignored, 1);
        assert_eq!(counters.images_ignored, 1);
        assert_eq!(counters.waveforms_ignored, 1);
        assert_eq!(probe.acquisition_calls.load(Ordering::SeqCst), 0);
        assert_eq!(probe.image_calls.load(Ordering::SeqCst), 0);
        // Conservation: everything seen is accounted for
        assert_eq!(
            counters.acquisitions_seen,
            counters.acquisitions_processed
                + counters.acquisitions_ignored
                + counters.acquisitions_wrongtype
        );
        assert_eq!(
            counters.images_seen,
            counters.images_processed + counters.images_ignored + counters.images_wrongtype
        );
    }

    #[tokio::test]
    async fn test_wrongtype_images_are_dropped_by_type_selection() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound = ScriptedInbound::new(vec![
            image(0, ImageType::Phase),
            image(0, ImageType::Magnitude),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(counters.images_wrongtype, 1);
        assert_eq!(counters.images_processed, 1);
        assert_eq!(*probe.group_sizes.lock().unwrap(), vec![(0, 1)]);
    }

    #[tokio::test]
    async fn test_waveforms_are_retained_but_never_flushed() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound = ScriptedInbound::new(vec![
            StreamMessage::Waveform(Waveform::new(Default::default(), vec![])),
            StreamMessage::Waveform(Waveform::new(Default::default(), vec![])),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(counters.waveforms_retained, 2);
        assert_eq!(engine.retained_waveforms().len(), 2);
        // No handler exists for waveforms; nothing was invoked
        assert_eq!(probe.acquisition_calls.load(Ordering::SeqCst), 0);
        assert_eq!(probe.image_calls.load(Ordering::SeqCst), 0);
    }

    // Scenario D: a raising capability still results in a Close frame and a
    // clean return to the caller.
    #[tokio::test]
    async fn test_capability_failure_still_sends_close() {
        let probe = Arc::new(Probe::failing(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound = ScriptedInbound::new(vec![
            acquisition(&[AcquisitionFlag::LastInSlice]),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(outbound.close_count(), 1);
        assert!(!outbound.error_logs().is_empty());
        assert_eq!(counters.acquisitions_processed, 0);
    }

    #[tokio::test]
    async fn test_protocol_error_reports_then_closes() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        // Two buffered acquisitions, then the transport corrupts
        let mut inbound = ScriptedInbound::with_tail_error(
            vec![acquisition(&[]), acquisition(&[])],
            MrdError::protocol("Unknown message type-id 77"),
        );
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        // The error is reported, the buffered group is still flushed, and
        // the session closes
        assert!(outbound
            .error_logs()
            .iter()
            .any(|text| text.contains("Unknown message type-id 77")));
        assert_eq!(counters.acquisitions_processed, 2);
        assert_eq!(outbound.close_count(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_tag_terminates_with_close() {
        let probe = Arc::new(Probe::new(Probe::keep_everything()));
        let mut engine = engine_with(Arc::clone(&probe));

        let mut inbound = ScriptedInbound::new(vec![
            acquisition(&[]),
            StreamMessage::ConfigName("too-late".into()),
            acquisition(&[]),
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        // The message after the stray tag was never consumed
        assert_eq!(counters.acquisitions_seen, 1);
        assert!(outbound
            .error_logs()
            .iter()
            .any(|text| text.contains("config-name")));
        assert_eq!(outbound.close_count(), 1);
    }

    #[tokio::test]
    async fn test_null_capability_ignores_everything() {
        let registry = CapabilityRegistry::with_builtins();
        let resolved = registry.resolve("null").unwrap();
        let mut engine = DispatchEngine::new(resolved, "");

        let mut inbound = ScriptedInbound::new(vec![
            acquisition(&[]),
            image(0, ImageType::Magnitude),
            StreamMessage::Close,
        ]);
        let mut outbound = RecordingOutbound::default();

        let counters = engine.run(&mut inbound, &mut outbound).await;

        assert_eq!(counters.acquisitions_ignored, 1);
        assert_eq!(counters.images_ignored, 1);
        assert_eq!(outbound.sent_images().len(), 0);
        assert_eq!(outbound.close_count(), 1);
    }
}
