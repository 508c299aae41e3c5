use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error;
use crate::error::Result as Result;

/// Reads exactly `len` bytes. The buffer grows with the bytes actually
/// present, so a forged length cannot force a large allocation.
pub (crate) fn read_exact_to_bin_vec(rdr: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    let mut vec = Vec::new();
    rdr.by_ref().take(len as u64).read_to_end(&mut vec)
        .map_err(error::map_decode_err)?;

    if vec.len() != len {
        return Err(error::decode(format!("expected {} bytes, found {}", len, vec.len()),
                                 Some("truncated field".into())));
    }

    Ok(vec)
}

pub (crate) fn fmt_bin_vec_to_hex(vec: &[u8]) -> String {
    vec
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

pub (crate) fn bin_vec_reverse_bytes(vec: &[u8]) -> Vec<u8> {
    let mut res = vec.to_vec();
    res.reverse();
    res
}

/// Reads a TPM2B: big-endian u16 size followed by that many bytes.
pub (crate) fn read_tpm2b(rdr: &mut impl Read) -> Result<Vec<u8>> {
    let size = rdr.read_u16::<BigEndian>()
        .map_err(error::map_decode_err)?;

    read_exact_to_bin_vec(rdr, size as usize)
}

pub (crate) fn write_tpm2b(wtr: &mut impl Write, data: &[u8]) -> Result<()> {
    let size: u16 = data.len().try_into()
        .map_err(error::map_conversion_err)?;
    wtr.write_u16::<BigEndian>(size)
        .map_err(error::map_io_err)?;
    wtr.write_all(data)
        .map_err(error::map_io_err)
}

/// Left-pads (or rejects) a value so that it occupies exactly `len` bytes.
pub (crate) fn pad_to(data: &[u8], len: usize) -> Option<Vec<u8>> {
    if data.len() > len {
        return None;
    }
    let mut out = vec![0; len - data.len()];
    out.extend_from_slice(data);
    Some(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::error::Kind;

    use super::{fmt_bin_vec_to_hex, pad_to, read_exact_to_bin_vec, read_tpm2b, write_tpm2b};

    #[test]
    fn tpm2b_layout() {
        let mut buf = Vec::new();
        write_tpm2b(&mut buf, &[0xde, 0xad]).unwrap();

        assert_eq!(buf, vec![0x00, 0x02, 0xde, 0xad]);
        assert_eq!(read_tpm2b(&mut Cursor::new(&buf)).unwrap(), vec![0xde, 0xad]);
    }

    #[test]
    fn tpm2b_truncated() {
        let buf = vec![0x00, 0x04, 0x01];

        assert!(read_tpm2b(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn length_beyond_input() {
        let buf = vec![0x01, 0x02, 0x03];

        let err = read_exact_to_bin_vec(&mut Cursor::new(&buf), 0xFFFF_FFF0).unwrap_err();

        assert_eq!(err.kind(), Kind::Decode);
    }

    #[test]
    fn hex_and_padding() {
        assert_eq!(fmt_bin_vec_to_hex(&[0x0a, 0xff]), "0aff");
        assert_eq!(pad_to(&[1, 2], 4), Some(vec![0, 0, 1, 2]));
        assert_eq!(pad_to(&[1, 2, 3], 2), None);
    }
}
