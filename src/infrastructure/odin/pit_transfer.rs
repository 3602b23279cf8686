//! PIT download helpers

use crate::domain::pit::{self, PitTable};
use crate::error::{Error, Result};
use crate::infrastructure::odin::commands::OdinLink;

/// Download the full PIT blob, sizing the buffer from the device.
pub fn download_pit_bytes(odin: &mut OdinLink<'_>, retries: u32) -> Result<Vec<u8>> {
    let pit_size = odin.get_pit_size(retries)?;
    if pit_size <= 0 {
        return Err(Error::protocol("device returned invalid PIT size"));
    }

    let mut buf = vec![0u8; pit_size as usize];
    odin.get_pit(&mut buf, retries)?;
    Ok(buf)
}

/// Download and parse in one step.
pub fn download_pit_table(odin: &mut OdinLink<'_>, retries: u32) -> Result<PitTable> {
    let bytes = download_pit_bytes(odin, retries)?;
    pit::parse(&bytes)
}
