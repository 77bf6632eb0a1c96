// OTA firmware sink
// Streams a downloaded image into the inactive app partition. The update is
// aborted on any mid-stream failure so a half-written image can never be
// marked bootable.

use anyhow::{bail, Context, Result};
use embedded_svc::io::Write;
use esp_idf_svc::ota::EspOta;
use log::info;

use crate::transport::FirmwareSink;

const FLASH_CHUNK: usize = 1024;

pub struct EspFirmwareSink;

impl EspFirmwareSink {
    pub fn new() -> Self {
        Self
    }
}

impl FirmwareSink for EspFirmwareSink {
    fn apply(
        &mut self,
        expected_len: Option<usize>,
        read_chunk: &mut dyn FnMut(&mut [u8]) -> Result<usize>,
    ) -> Result<()> {
        let mut ota = EspOta::new().context("opening OTA partitions")?;
        let mut update = ota.initiate_update().context("initiating OTA update")?;

        let mut buf = [0u8; FLASH_CHUNK];
        let mut written = 0usize;
        loop {
            let n = match read_chunk(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    let _ = update.abort();
                    return Err(err).context("reading firmware stream");
                }
            };
            if let Err(err) = update.write_all(&buf[..n]) {
                let _ = update.abort();
                bail!("writing firmware to flash failed: {:?}", err);
            }
            written += n;
        }

        if let Some(expected) = expected_len {
            if written != expected {
                let _ = update.abort();
                bail!(
                    "firmware stream truncated: got {} of {} bytes",
                    written,
                    expected
                );
            }
        }
        if written == 0 {
            let _ = update.abort();
            bail!("firmware stream was empty");
        }

        update.complete().context("committing OTA update")?;
        info!("Firmware image of {} bytes committed", written);
        Ok(())
    }
}
