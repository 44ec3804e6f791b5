//! MPEG-TS segment inspection.
//!
//! Extracts the raw PTS/DTS of the first and last PES packet of the audio and video
//! elementary streams in a transport stream segment. Only headers are read; payloads are
//! never demuxed.

use std::collections::HashMap;

use tracing::trace;

use crate::error::InspectError;
use crate::timestamp::rollover::StreamKind;

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

const PID_PAT: u16 = 0x0000;

// Elementary stream types (ISO 13818-1 Table 2-34)
const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
const STREAM_TYPE_ADTS: u8 = 0x0F;
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_H265: u8 = 0x24;

/// Raw 33-bit timestamps of one PES packet. `dts` equals `pts` when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesTimestamp {
    pub pts: i64,
    pub dts: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTimestamps {
    pub first: Option<PesTimestamp>,
    pub last: Option<PesTimestamp>,
}

impl StreamTimestamps {
    fn record(&mut self, timestamp: PesTimestamp) {
        if self.first.is_none() {
            self.first = Some(timestamp);
        }
        self.last = Some(timestamp);
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentTimestamps {
    pub audio: StreamTimestamps,
    pub video: StreamTimestamps,
}

impl SegmentTimestamps {
    pub fn stream(&self, kind: StreamKind) -> &StreamTimestamps {
        match kind {
            StreamKind::Audio => &self.audio,
            StreamKind::Video => &self.video,
        }
    }

    fn stream_mut(&mut self, kind: StreamKind) -> &mut StreamTimestamps {
        match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
        }
    }
}

/// Whether `data` looks like a transport stream.
pub fn is_transport_stream(data: &[u8]) -> bool {
    data.len() >= TS_PACKET_SIZE && data[0] == SYNC_BYTE
}

/// Parse a 33-bit PTS or DTS timestamp from 5 bytes.
///
/// Layout: `[marker(4) | ts32..30 | 1 | ts29..15 | 1 | ts14..0 | 1]`
fn parse_timestamp(data: &[u8]) -> i64 {
    ((((data[0] as u64 >> 1) & 0x07) << 30)
        | ((data[1] as u64) << 22)
        | (((data[2] as u64 >> 1) & 0x7F) << 15)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64 >> 1) & 0x7F)) as i64
}

/// Read PTS/DTS from the start of a PES packet.
fn parse_pes_timestamps(data: &[u8]) -> Result<Option<PesTimestamp>, InspectError> {
    if data.len() < 9 {
        return Err(InspectError::InsufficientData {
            expected: 9,
            actual: data.len(),
        });
    }
    if data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 {
        return Err(InspectError::InvalidPesStartCode);
    }

    let pts_dts_flags = (data[7] >> 6) & 0x03;
    match pts_dts_flags {
        0b00 => Ok(None),
        0b10 => {
            if data.len() < 14 {
                return Err(InspectError::InsufficientData {
                    expected: 14,
                    actual: data.len(),
                });
            }
            let pts = parse_timestamp(&data[9..14]);
            Ok(Some(PesTimestamp { pts, dts: pts }))
        }
        0b11 => {
            if data.len() < 19 {
                return Err(InspectError::InsufficientData {
                    expected: 19,
                    actual: data.len(),
                });
            }
            Ok(Some(PesTimestamp {
                pts: parse_timestamp(&data[9..14]),
                dts: parse_timestamp(&data[14..19]),
            }))
        }
        flags => Err(InspectError::InvalidPtsDtsFlags(flags)),
    }
}

/// Header fields of one transport packet needed for inspection.
struct PacketView<'a> {
    pid: u16,
    payload_unit_start: bool,
    payload: &'a [u8],
}

fn parse_packet(packet: &[u8], offset: usize) -> Result<PacketView<'_>, InspectError> {
    if packet[0] != SYNC_BYTE {
        return Err(InspectError::InvalidSyncByte(packet[0], offset));
    }

    let payload_unit_start = (packet[1] & 0x40) != 0;
    let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
    let adaptation_field_control = (packet[3] >> 4) & 0x03;

    let mut start = 4;
    if adaptation_field_control & 0x02 != 0 {
        start += 1 + packet[4] as usize;
    }
    let payload = if adaptation_field_control & 0x01 != 0 && start < packet.len() {
        &packet[start..]
    } else {
        &[]
    };

    Ok(PacketView {
        pid,
        payload_unit_start,
        payload,
    })
}

/// Skip the pointer field of a PSI section and return `(section, section_end)`.
fn psi_section(payload: &[u8]) -> Option<(&[u8], usize)> {
    let pointer = *payload.first()? as usize;
    let section = payload.get(1 + pointer..)?;
    if section.len() < 3 {
        return None;
    }
    let section_length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    // exclude the trailing CRC32
    let end = (3 + section_length).saturating_sub(4).min(section.len());
    Some((section, end))
}

/// Inspects transport stream segments for timing information.
#[derive(Debug, Default, Clone)]
pub struct SegmentInspector;

impl SegmentInspector {
    pub fn new() -> Self {
        Self
    }

    /// Collect the first and last timestamps of every audio and video stream.
    pub fn inspect(&self, data: &[u8]) -> Result<SegmentTimestamps, InspectError> {
        if data.len() < TS_PACKET_SIZE {
            return Err(InspectError::InsufficientData {
                expected: TS_PACKET_SIZE,
                actual: data.len(),
            });
        }

        let mut pmt_pid: Option<u16> = None;
        let mut streams: HashMap<u16, StreamKind> = HashMap::new();
        let mut timestamps = SegmentTimestamps::default();

        for (index, packet) in data.chunks_exact(TS_PACKET_SIZE).enumerate() {
            let view = parse_packet(packet, index * TS_PACKET_SIZE)?;

            if view.pid == PID_PAT {
                if view.payload_unit_start {
                    pmt_pid = Self::parse_pat(view.payload).or(pmt_pid);
                }
                continue;
            }

            if Some(view.pid) == pmt_pid {
                if view.payload_unit_start {
                    Self::parse_pmt(view.payload, &mut streams);
                }
                continue;
            }

            let Some(&kind) = streams.get(&view.pid) else {
                continue;
            };
            if !view.payload_unit_start {
                continue;
            }
            if let Some(timestamp) = parse_pes_timestamps(view.payload)? {
                timestamps.stream_mut(kind).record(timestamp);
            }
        }

        if timestamps.audio.is_empty() && timestamps.video.is_empty() {
            return Err(InspectError::NoTimestamps);
        }

        trace!(
            audio = ?timestamps.audio,
            video = ?timestamps.video,
            "Inspected segment timestamps"
        );
        Ok(timestamps)
    }

    fn parse_pat(payload: &[u8]) -> Option<u16> {
        let (section, end) = psi_section(payload)?;
        let mut offset = 8;
        while offset + 4 <= end {
            let program_number = ((section[offset] as u16) << 8) | section[offset + 1] as u16;
            let pid = ((section[offset + 2] as u16 & 0x1F) << 8) | section[offset + 3] as u16;
            if program_number != 0 {
                return Some(pid);
            }
            offset += 4;
        }
        None
    }

    fn parse_pmt(payload: &[u8], streams: &mut HashMap<u16, StreamKind>) {
        let Some((section, end)) = psi_section(payload) else {
            return;
        };
        if section.len() < 12 {
            return;
        }
        let program_info_length =
            (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;

        let mut offset = 12 + program_info_length;
        while offset + 5 <= end {
            let stream_type = section[offset];
            let pid = ((section[offset + 1] as u16 & 0x1F) << 8) | section[offset + 2] as u16;
            let es_info_length =
                (((section[offset + 3] & 0x0F) as usize) << 8) | section[offset + 4] as usize;

            let kind = match stream_type {
                STREAM_TYPE_H264 | STREAM_TYPE_H265 => Some(StreamKind::Video),
                STREAM_TYPE_ADTS | STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO => {
                    Some(StreamKind::Audio)
                }
                _ => None,
            };
            if let Some(kind) = kind {
                streams.insert(pid, kind);
            }

            offset += 5 + es_info_length;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const PMT_PID: u16 = 0x1000;
    pub(crate) const VIDEO_PID: u16 = 0x0100;
    pub(crate) const AUDIO_PID: u16 = 0x0101;

    fn packet(pid: u16, payload_unit_start: bool, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0xFF; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = ((payload_unit_start as u8) << 6) | ((pid >> 8) as u8 & 0x1F);
        packet[2] = pid as u8;

        let stuffing = TS_PACKET_SIZE - 4 - payload.len();
        if stuffing == 0 {
            packet[3] = 0x10;
            packet[4..].copy_from_slice(payload);
        } else {
            // adaptation field followed by payload
            packet[3] = 0x30;
            packet[4] = (stuffing - 1) as u8;
            if stuffing > 1 {
                packet[5] = 0x00;
            }
            packet[4 + stuffing..].copy_from_slice(payload);
        }
        packet
    }

    fn encode_timestamp(marker: u8, ts: u64) -> [u8; 5] {
        [
            (marker << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1,
            (ts >> 22) as u8,
            ((((ts >> 15) & 0x7F) as u8) << 1) | 1,
            (ts >> 7) as u8,
            (((ts & 0x7F) as u8) << 1) | 1,
        ]
    }

    fn pes(stream_id: u8, pts: u64, dts: Option<u64>) -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80];
        match dts {
            Some(dts) => {
                pes.extend_from_slice(&[0xC0, 10]);
                pes.extend_from_slice(&encode_timestamp(0x3, pts));
                pes.extend_from_slice(&encode_timestamp(0x1, dts));
            }
            None => {
                pes.extend_from_slice(&[0x80, 5]);
                pes.extend_from_slice(&encode_timestamp(0x2, pts));
            }
        }
        pes.extend_from_slice(&[0xAA; 8]);
        pes
    }

    fn pat() -> Vec<u8> {
        let mut section = vec![0x00, 0x00, 0xB0, 13, 0x00, 0x01, 0xC1, 0x00, 0x00];
        section.extend_from_slice(&[0x00, 0x01, 0xE0 | (PMT_PID >> 8) as u8, PMT_PID as u8]);
        section.extend_from_slice(&[0; 4]);
        section
    }

    fn pmt() -> Vec<u8> {
        let mut section = vec![
            0x00, 0x02, 0xB0, 23, 0x00, 0x01, 0xC1, 0x00, 0x00, 0xE1, 0x00, 0xF0, 0x00,
        ];
        section.extend_from_slice(&[
            STREAM_TYPE_H264,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
        ]);
        section.extend_from_slice(&[
            STREAM_TYPE_ADTS,
            0xE0 | (AUDIO_PID >> 8) as u8,
            AUDIO_PID as u8,
            0xF0,
            0x00,
        ]);
        section.extend_from_slice(&[0; 4]);
        section
    }

    /// A transport stream segment with one PES per `(pid, pts, dts)` entry.
    pub(crate) fn synthetic_segment(pes_packets: &[(u16, u64, Option<u64>)]) -> Vec<u8> {
        let mut segment = packet(0, true, &pat());
        segment.extend(packet(PMT_PID, true, &pmt()));
        for &(pid, pts, dts) in pes_packets {
            let stream_id = if pid == VIDEO_PID { 0xE0 } else { 0xC0 };
            segment.extend(packet(pid, true, &pes(stream_id, pts, dts)));
            segment.extend(packet(pid, false, &[0xBB; 32]));
        }
        segment
    }

    #[test]
    fn finds_first_and_last_timestamps_per_stream() {
        let data = synthetic_segment(&[
            (VIDEO_PID, 183_000, Some(180_000)),
            (AUDIO_PID, 180_000, None),
            (VIDEO_PID, 363_000, Some(360_000)),
            (AUDIO_PID, 540_000, None),
            (VIDEO_PID, 1_083_000, Some(1_080_000)),
        ]);

        let timestamps = SegmentInspector::new().inspect(&data).unwrap();
        assert_eq!(
            timestamps.video.first,
            Some(PesTimestamp { pts: 183_000, dts: 180_000 })
        );
        assert_eq!(
            timestamps.video.last,
            Some(PesTimestamp { pts: 1_083_000, dts: 1_080_000 })
        );
        assert_eq!(
            timestamps.audio.first,
            Some(PesTimestamp { pts: 180_000, dts: 180_000 })
        );
        assert_eq!(
            timestamps.audio.last,
            Some(PesTimestamp { pts: 540_000, dts: 540_000 })
        );
    }

    #[test]
    fn reads_full_33_bit_timestamps() {
        let data = synthetic_segment(&[(VIDEO_PID, 8_589_934_590, None)]);
        let timestamps = SegmentInspector::new().inspect(&data).unwrap();
        assert_eq!(timestamps.video.first.map(|ts| ts.pts), Some(8_589_934_590));
        assert!(timestamps.audio.is_empty());
    }

    #[test]
    fn rejects_non_transport_stream() {
        let data = vec![0u8; TS_PACKET_SIZE * 2];
        assert!(!is_transport_stream(&data));
        assert_eq!(
            SegmentInspector::new().inspect(&data),
            Err(InspectError::InvalidSyncByte(0, 0))
        );
    }

    #[test]
    fn segment_without_pes_has_no_timestamps() {
        let mut data = packet(0, true, &pat());
        data.extend(packet(PMT_PID, true, &pmt()));
        assert_eq!(
            SegmentInspector::new().inspect(&data),
            Err(InspectError::NoTimestamps)
        );
    }

    #[test]
    fn short_input_is_insufficient() {
        assert_eq!(
            SegmentInspector::new().inspect(&[SYNC_BYTE; 10]),
            Err(InspectError::InsufficientData {
                expected: TS_PACKET_SIZE,
                actual: 10,
            })
        );
    }
}
