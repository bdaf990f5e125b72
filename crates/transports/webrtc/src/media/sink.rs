//! Inbound audio sinks
//!
//! Every accepted remote audio track gets its own sink, created through a
//! [`SinkFactory`] and driven by the peer's inbound relay loop.

use crate::config::{AudioSinkConfig, SinkTarget, StreamCodec};
use crate::{Error, Result};
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, info};
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::Writer;
use webrtc::rtp::packet::Packet;

/// Local playback/recording pipeline for one inbound track
pub trait SinkPipeline: Send {
    fn start(&mut self) -> Result<()>;

    /// Push one RTP packet as read from the remote track
    fn push(&mut self, packet: &Packet) -> Result<()>;

    fn stop(&mut self) -> Result<()>;
}

/// Creates a sink per accepted inbound track
pub trait SinkFactory: Send + Sync {
    fn create(&self, session_id: &str, codec: StreamCodec) -> Result<Box<dyn SinkPipeline>>;
}

/// Counts packets and discards them
#[derive(Debug, Default)]
pub struct NullSink {
    session_id: String,
    packets: u64,
    bytes: u64,
}

impl NullSink {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Default::default()
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }
}

impl SinkPipeline for NullSink {
    fn start(&mut self) -> Result<()> {
        debug!(session_id = %self.session_id, "Null sink started");
        Ok(())
    }

    fn push(&mut self, packet: &Packet) -> Result<()> {
        self.packets += 1;
        self.bytes += packet.payload.len() as u64;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        info!(
            session_id = %self.session_id,
            packets = self.packets,
            bytes = self.bytes,
            "Null sink stopped"
        );
        Ok(())
    }
}

/// Depayloads Opus RTP into an Ogg file
pub struct OggFileSink {
    path: PathBuf,
    sample_rate: u32,
    channels: u8,
    writer: Option<OggWriter<File>>,
}

impl OggFileSink {
    pub fn new(path: PathBuf, sample_rate: u32, channels: u8) -> Self {
        Self {
            path,
            sample_rate,
            channels,
            writer: None,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl SinkPipeline for OggFileSink {
    fn start(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let file = File::create(&self.path)?;
        let writer = OggWriter::new(file, self.sample_rate, self.channels)
            .map_err(|e| Error::SinkError(format!("{}: {}", self.path.display(), e)))?;
        info!(path = %self.path.display(), "Ogg sink started");
        self.writer = Some(writer);
        Ok(())
    }

    fn push(&mut self, packet: &Packet) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::SinkError("ogg sink is not started".to_string()))?;
        writer
            .write_rtp(packet)
            .map_err(|e| Error::SinkError(e.to_string()))
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .close()
                .map_err(|e| Error::SinkError(e.to_string()))?;
            info!(path = %self.path.display(), "Ogg sink closed");
        }
        Ok(())
    }
}

/// Factory driven by [`AudioSinkConfig::target`]
#[derive(Debug, Clone)]
pub struct TargetSinkFactory {
    config: AudioSinkConfig,
}

impl TargetSinkFactory {
    pub fn new(config: AudioSinkConfig) -> Result<Self> {
        if let SinkTarget::OggDir { dir } = &config.target {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { config })
    }
}

impl SinkFactory for TargetSinkFactory {
    fn create(&self, session_id: &str, codec: StreamCodec) -> Result<Box<dyn SinkPipeline>> {
        if codec != StreamCodec::Opus {
            return Err(Error::SinkError(format!("no sink for codec {}", codec)));
        }

        match &self.config.target {
            SinkTarget::Null => Ok(Box::new(NullSink::new(session_id))),
            SinkTarget::OggDir { dir } => {
                let file_name: String = session_id
                    .chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                    .collect();
                Ok(Box::new(OggFileSink::new(
                    dir.join(format!("{}.ogg", file_name)),
                    self.config.clock_rate,
                    self.config.channels,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use webrtc::rtp::header::Header;

    fn opus_packet(seq: u16) -> Packet {
        Packet {
            header: Header {
                version: 2,
                payload_type: 111,
                sequence_number: seq,
                timestamp: seq as u32 * 960,
                ssrc: 42,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xfc, 0xff, 0xfe]),
        }
    }

    #[test]
    fn test_null_sink_counts_packets() {
        let mut sink = NullSink::new("peer-1");
        sink.start().unwrap();
        sink.push(&opus_packet(1)).unwrap();
        sink.push(&opus_packet(2)).unwrap();
        assert_eq!(sink.packets(), 2);
        sink.stop().unwrap();
    }

    #[test]
    fn test_ogg_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let factory = TargetSinkFactory::new(AudioSinkConfig {
            target: SinkTarget::OggDir {
                dir: dir.path().to_path_buf(),
            },
            ..Default::default()
        })
        .unwrap();

        let mut sink = factory.create("peer/1", StreamCodec::Opus).unwrap();
        sink.start().unwrap();
        for seq in 0..5 {
            sink.push(&opus_packet(seq)).unwrap();
        }
        sink.stop().unwrap();

        let written = std::fs::read(dir.path().join("peer_1.ogg")).unwrap();
        assert_eq!(&written[..4], b"OggS");
    }

    #[test]
    fn test_push_before_start_fails() {
        let mut sink = OggFileSink::new("/tmp/unused.ogg".into(), 48000, 1);
        assert!(matches!(
            sink.push(&opus_packet(0)),
            Err(Error::SinkError(_))
        ));
    }

    #[test]
    fn test_factory_rejects_non_opus() {
        let factory = TargetSinkFactory::new(AudioSinkConfig::default()).unwrap();
        assert!(factory.create("peer-1", StreamCodec::Vp8).is_err());
    }
}
