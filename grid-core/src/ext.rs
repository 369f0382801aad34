use bytes::{Buf, Bytes};
use tracing_subscriber::fmt::time::LocalTime;

use crate::error::{GridError, Result};

/// Checked reads over a wire buffer. A short buffer reads as a protocol
/// mismatch, never a panic; truncation is an expected symptom of version
/// skew between sender and receiver.
pub fn read_u8(src: &mut Bytes) -> Result<u8> {
    ensure_remaining(src, 1)?;
    Ok(src.get_u8())
}

pub fn read_u16(src: &mut Bytes) -> Result<u16> {
    ensure_remaining(src, 2)?;
    Ok(src.get_u16())
}

pub fn read_u32(src: &mut Bytes) -> Result<u32> {
    ensure_remaining(src, 4)?;
    Ok(src.get_u32())
}

pub fn read_u64(src: &mut Bytes) -> Result<u64> {
    ensure_remaining(src, 8)?;
    Ok(src.get_u64())
}

pub fn read_bytes(src: &mut Bytes, len: usize) -> Result<Bytes> {
    ensure_remaining(src, len)?;
    Ok(src.split_to(len))
}

fn ensure_remaining(src: &Bytes, needed: usize) -> Result<()> {
    if src.remaining() < needed {
        Err(GridError::mismatch(format!(
            "buffer underflow: need {} bytes, {} remaining",
            needed,
            src.remaining()
        )))
    } else {
        Ok(())
    }
}

pub fn init_logger(level: tracing::Level) {
    let format = tracing_subscriber::fmt::format()
        .with_timer(LocalTime::rfc_3339())
        .compact();
    tracing_subscriber::FmtSubscriber::builder()
        .event_format(format)
        .with_max_level(level)
        .try_init()
        .ok();
}
