use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::cpu::assembler::Image;

pub const ROM_START: u16 = 0xf000;
pub const ROM_SIZE: usize = 0x1000;

#[derive(Debug, Error)]
pub enum RomError {
    #[error("rom image must be exactly 4096 bytes, got {0}")]
    WrongSize(usize),
    #[error("image {origin:#06x}..{end:#07x} does not fit the rom window 0xf000..0x10000")]
    OutsideWindow { origin: u16, end: u32 },
    #[error("failed to read rom file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Rom {
    data: Vec<u8>,
}

impl Rom {
    pub fn new(raw: &[u8]) -> Result<Rom, RomError> {
        if raw.len() != ROM_SIZE {
            return Err(RomError::WrongSize(raw.len()));
        }
        Ok(Rom { data: raw.to_vec() })
    }

    pub fn new_from_file<P: AsRef<Path>>(rom_file: P) -> Result<Rom, RomError> {
        let raw = std::fs::read(&rom_file).map_err(|source| RomError::Io {
            path: rom_file.as_ref().to_path_buf(),
            source,
        })?;
        Rom::new(&raw)
    }

    /// Place an assembled image into the window; bytes it does not cover are 0.
    pub fn from_image(image: &Image) -> Result<Rom, RomError> {
        let end = image.end();
        if image.origin < ROM_START || end > 0x10000 {
            return Err(RomError::OutsideWindow {
                origin: image.origin,
                end,
            });
        }
        let mut data = vec![0; ROM_SIZE];
        let offset = (image.origin - ROM_START) as usize;
        data[offset..offset + image.bytes.len()].copy_from_slice(&image.bytes);
        Ok(Rom { data })
    }

    // offsets past the end read as 0
    pub fn read(&self, offset: u16) -> u8 {
        self.data.get(offset as usize).copied().unwrap_or(0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cpu::assembler::assemble;

    #[test]
    fn test_wrong_size() {
        match Rom::new(&[0u8; 16]) {
            Err(RomError::WrongSize(16)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_from_image() {
        let image = assemble(".org 0xfffe\n.data 0xf000\n").unwrap();
        let rom = Rom::from_image(&image).unwrap();
        assert_eq!(rom.as_bytes().len(), ROM_SIZE);
        assert_eq!(rom.read(0x0ffe), 0x00);
        assert_eq!(rom.read(0x0fff), 0xf0);
        assert_eq!(rom.read(0x1000), 0x00);
    }

    #[test]
    fn test_image_outside_window() {
        let image = assemble(".org 0x1000\nnop\n").unwrap();
        match Rom::from_image(&image) {
            Err(RomError::OutsideWindow { origin, end }) => {
                assert_eq!(origin, 0x1000);
                assert_eq!(end, 0x1002);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_file() {
        let err = Rom::new_from_file("/nonexistent/r16.bin").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/r16.bin"));
    }
}
