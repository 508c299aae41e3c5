//! TCG crypto-agile measurement log (TCG_PCR_EVENT2, little-endian).

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::mem::size_of;

use bytemuck::{Pod, Zeroable};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use serde::Serialize;

use crate::common::binary::read_exact_to_bin_vec;
use crate::common::hash::sha256_extend;
use crate::error::{self, Result};
use crate::tpm::platform::ConfidentialTechnology;
use crate::tpm::structures::TPM_ALG_SHA256;

pub const EV_POST_CODE: u32 = 0x1;
pub const EV_NO_ACTION: u32 = 0x3;
pub const EV_SEPARATOR: u32 = 0x4;
pub const EV_S_CRTM_VERSION: u32 = 0x8;
pub const EV_NONHOST_INFO: u32 = 0x11;

const SPEC_ID_SIGNATURE: &[u8; 16] = b"Spec ID Event03\0";
const SHA1_DIGEST_BYTES: usize = 20;
const SHA256_DIGEST_BYTES: u16 = 32;

pub const NONHOST_INFO_SIGNATURE: &[u8; 16] = b"GCE NonHostInfo\0";

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PcrEvent {
    pub index: u32,
    pub event_type: u32,
    /// SHA-256 bank digest.
    #[serde(with = "hex::serde")]
    pub digest: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

impl PcrEvent {
    /// An event measuring `data` itself.
    pub fn measure(index: u32, event_type: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            event_type,
            digest: crate::common::hash::sha256(&data).to_vec(),
            data,
        }
    }
}

/// Event payload published by GCE firmware describing the host.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GceNonHostInfo {
    signature: [u8; 16],
    technology: u8,
    reserved: [u8; 15],
}

unsafe impl Zeroable for GceNonHostInfo {}

unsafe impl Pod for GceNonHostInfo {}

impl GceNonHostInfo {
    pub fn new(technology: ConfidentialTechnology) -> Self {
        Self {
            signature: *NONHOST_INFO_SIGNATURE,
            technology: technology.into(),
            reserved: [0; 15],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }

    fn from_event_data(data: &[u8]) -> Option<Self> {
        let raw = data.get(..size_of::<Self>())?;
        let info: Self = bytemuck::pod_read_unaligned(raw);

        if &info.signature == NONHOST_INFO_SIGNATURE {
            Some(info)
        } else {
            None
        }
    }
}

/// Parses a crypto-agile log, keeping the SHA-256 digest of each event.
pub fn parse(log: &[u8]) -> Result<Vec<PcrEvent>> {
    if log.is_empty() {
        return Ok(Vec::new());
    }

    let mut rdr = Cursor::new(log);
    let digest_sizes = read_spec_id_event(&mut rdr)?;

    let mut events = Vec::new();
    while (rdr.position() as usize) < log.len() {
        let index = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let event_type = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;

        let count = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let mut digest = None;
        for _ in 0..count {
            let alg = rdr.read_u16::<LittleEndian>().map_err(error::map_decode_err)?;
            let size = digest_sizes.get(&alg)
                .ok_or_else(|| error::decode(format!("digest algorithm 0x{:04x} not declared", alg),
                                             Some("failed to parse event log".into())))?;
            let value = read_exact_to_bin_vec(&mut rdr, *size as usize)?;
            if alg == TPM_ALG_SHA256 {
                digest = Some(value);
            }
        }

        let size = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
        let data = read_exact_to_bin_vec(&mut rdr, size as usize)?;

        let digest = digest.ok_or_else(|| error::decode(
            format!("event {} has no SHA-256 digest", events.len()),
            Some("failed to parse event log".into())))?;

        events.push(PcrEvent { index, event_type, digest, data });
    }

    debug!("parsed {} measurement log events", events.len());

    Ok(events)
}

fn read_spec_id_event(rdr: &mut Cursor<&[u8]>) -> Result<BTreeMap<u16, u16>> {
    let _index = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
    let event_type = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
    let _sha1 = read_exact_to_bin_vec(rdr, SHA1_DIGEST_BYTES)?;
    let size = rdr.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
    let event = read_exact_to_bin_vec(rdr, size as usize)?;

    if event_type != EV_NO_ACTION || !event.starts_with(SPEC_ID_SIGNATURE) {
        return Err(error::decode("missing Spec ID event",
                                 Some("event log is not in crypto-agile format".into())));
    }

    let mut event = Cursor::new(&event[SPEC_ID_SIGNATURE.len()..]);
    let _platform_class = event.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;
    let _version = read_exact_to_bin_vec(&mut event, 4)?;
    let count = event.read_u32::<LittleEndian>().map_err(error::map_decode_err)?;

    let mut sizes = BTreeMap::new();
    for _ in 0..count {
        let alg = event.read_u16::<LittleEndian>().map_err(error::map_decode_err)?;
        let size = event.read_u16::<LittleEndian>().map_err(error::map_decode_err)?;
        sizes.insert(alg, size);
    }

    Ok(sizes)
}

/// Encodes events as a crypto-agile log with a single SHA-256 bank.
pub fn encode(events: &[PcrEvent]) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    let mut spec_id = SPEC_ID_SIGNATURE.to_vec();
    spec_id.write_u32::<LittleEndian>(0).map_err(error::map_io_err)?;
    // minor, major, errata, uintn size
    spec_id.write_all(&[0, 2, 0, 2]).map_err(error::map_io_err)?;
    spec_id.write_u32::<LittleEndian>(1).map_err(error::map_io_err)?;
    spec_id.write_u16::<LittleEndian>(TPM_ALG_SHA256).map_err(error::map_io_err)?;
    spec_id.write_u16::<LittleEndian>(SHA256_DIGEST_BYTES).map_err(error::map_io_err)?;
    spec_id.write_u8(0).map_err(error::map_io_err)?;

    out.write_u32::<LittleEndian>(0).map_err(error::map_io_err)?;
    out.write_u32::<LittleEndian>(EV_NO_ACTION).map_err(error::map_io_err)?;
    out.write_all(&[0; SHA1_DIGEST_BYTES]).map_err(error::map_io_err)?;
    out.write_u32::<LittleEndian>(spec_id.len() as u32).map_err(error::map_io_err)?;
    out.write_all(&spec_id).map_err(error::map_io_err)?;

    for event in events {
        if event.digest.len() != SHA256_DIGEST_BYTES as usize {
            return Err(error::invalid_argument("event digest must be a SHA-256 value"));
        }

        out.write_u32::<LittleEndian>(event.index).map_err(error::map_io_err)?;
        out.write_u32::<LittleEndian>(event.event_type).map_err(error::map_io_err)?;
        out.write_u32::<LittleEndian>(1).map_err(error::map_io_err)?;
        out.write_u16::<LittleEndian>(TPM_ALG_SHA256).map_err(error::map_io_err)?;
        out.write_all(&event.digest).map_err(error::map_io_err)?;
        out.write_u32::<LittleEndian>(event.data.len() as u32).map_err(error::map_io_err)?;
        out.write_all(&event.data).map_err(error::map_io_err)?;
    }

    Ok(out)
}

/// Replays the log into the SHA-256 bank for `pcrs`. PCRs without events stay zero.
pub fn replay(events: &[PcrEvent], pcrs: &[u32]) -> BTreeMap<u32, [u8; 32]> {
    let mut bank: BTreeMap<u32, [u8; 32]> = pcrs.iter().map(|pcr| (*pcr, [0; 32])).collect();

    for event in events.iter().filter(|e| e.event_type != EV_NO_ACTION) {
        if let Some(value) = bank.get_mut(&event.index) {
            *value = sha256_extend(value, &event.digest);
        }
    }

    bank
}

/// Reads the technology from the NonHostInfo event. Absent means no confidential
/// technology; conflicting events are rejected.
pub fn nonhost_technology(events: &[PcrEvent]) -> Result<ConfidentialTechnology> {
    let mut found: Option<ConfidentialTechnology> = None;

    for event in events.iter().filter(|e| e.event_type == EV_NONHOST_INFO) {
        let Some(info) = GceNonHostInfo::from_event_data(&event.data) else {
            continue;
        };
        let technology = ConfidentialTechnology::from(info.technology);

        match found {
            Some(previous) if previous != technology => {
                return Err(error::verification(format!(
                    "conflicting NonHostInfo events: {:?} and {:?}", previous, technology)));
            }
            _ => found = Some(technology),
        }
    }

    Ok(found.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use crate::common::hash::sha256_extend;
    use crate::error::Kind;
    use crate::tpm::platform::ConfidentialTechnology;
    use crate::tpm::structures::TPM_ALG_SHA256;

    use super::{encode, nonhost_technology, parse, replay, GceNonHostInfo, PcrEvent,
                EV_NONHOST_INFO, EV_NO_ACTION, EV_SEPARATOR};

    fn boot_events(technology: ConfidentialTechnology) -> Vec<PcrEvent> {
        vec![
            PcrEvent::measure(0, EV_NONHOST_INFO, GceNonHostInfo::new(technology).to_bytes()),
            PcrEvent::measure(0, EV_SEPARATOR, vec![0; 4]),
            PcrEvent::measure(7, EV_SEPARATOR, vec![0; 4]),
        ]
    }

    #[test]
    fn nonhost_info_is_32_bytes() {
        let bytes = GceNonHostInfo::new(ConfidentialTechnology::AmdSevSnp).to_bytes();

        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..16], b"GCE NonHostInfo\0");
        assert_eq!(bytes[16], 4);
    }

    #[test]
    fn encoded_log_parses_back() {
        let events = boot_events(ConfidentialTechnology::IntelTdx);

        let log = encode(&events).unwrap();

        assert_eq!(parse(&log).unwrap(), events);
        assert!(parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_log() {
        let log = encode(&boot_events(ConfidentialTechnology::None)).unwrap();

        assert_eq!(parse(&log[..log.len() - 1]).unwrap_err().kind(), Kind::Decode);
        assert_eq!(parse(&[1, 2, 3]).unwrap_err().kind(), Kind::Decode);
    }

    #[test]
    fn event_size_beyond_log() {
        let mut log = encode(&[]).unwrap();
        log.extend_from_slice(&0u32.to_le_bytes());
        log.extend_from_slice(&EV_SEPARATOR.to_le_bytes());
        log.extend_from_slice(&1u32.to_le_bytes());
        log.extend_from_slice(&TPM_ALG_SHA256.to_le_bytes());
        log.extend_from_slice(&[0; 32]);
        log.extend_from_slice(&0xFFFF_FFF0u32.to_le_bytes());

        assert_eq!(parse(&log).unwrap_err().kind(), Kind::Decode);
    }

    #[test]
    fn replay_extends_in_order() {
        let events = boot_events(ConfidentialTechnology::None);

        let bank = replay(&events, &[0, 1, 7]);

        let pcr0 = sha256_extend(&sha256_extend(&[0; 32], &events[0].digest), &events[1].digest);
        assert_eq!(bank[&0], pcr0);
        assert_eq!(bank[&1], [0; 32]);
        assert_eq!(bank[&7], sha256_extend(&[0; 32], &events[2].digest));
    }

    #[test]
    fn replay_skips_no_action() {
        let events = vec![PcrEvent::measure(0, EV_NO_ACTION, b"startup locality".to_vec())];

        assert_eq!(replay(&events, &[0])[&0], [0; 32]);
    }

    #[test]
    fn technology_from_events() {
        assert_eq!(nonhost_technology(&boot_events(ConfidentialTechnology::AmdSevSnp)).unwrap(),
                   ConfidentialTechnology::AmdSevSnp);
        assert_eq!(nonhost_technology(&[]).unwrap(), ConfidentialTechnology::None);

        let mut events = boot_events(ConfidentialTechnology::AmdSevSnp);
        events.push(PcrEvent::measure(0, EV_NONHOST_INFO,
                                      GceNonHostInfo::new(ConfidentialTechnology::IntelTdx).to_bytes()));

        assert_eq!(nonhost_technology(&events).unwrap_err().kind(), Kind::Verification);
    }
}
