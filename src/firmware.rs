//! Vendor firmware container and the fragmenting download protocol.
//!
//! Image layout (little-endian):
//!
//! ```text
//! signature[8] = "Realtech" | version u16 | patch_count u16 | patch_length u32
//! patch_count x patch_length bytes of opaque patch data
//! ```
//!
//! Patch contents are never interpreted; only the container is validated.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::{debug, info, warn};

use crate::config::VendorProfile;
use crate::errors::LoadError;
use crate::hci::CommandEngine;
use crate::transport::ByteStream;

pub const RTK_SIGNATURE: &[u8; 8] = b"Realtech";
pub const IMAGE_HEADER_LEN: usize = 16;

/// Fragment tags, part of the wire contract.
pub const FRAGMENT_FIRST: u8 = 0x00;
pub const FRAGMENT_CONTINUATION: u8 = 0x01;

const DOWNLOAD_SUBCOMMAND: u8 = 0x01;
const CONFIG_SUBCOMMAND: u8 = 0x08;
const ENTER_DOWNLOAD: u8 = 0x01;
const LAUNCH: u8 = 0x00;
/// Download parameters carry three bytes of framing ahead of the data.
const FRAGMENT_OVERHEAD: usize = 3;
const CONFIG_OVERHEAD: usize = 2;
pub const MAX_CONFIG_LEN: usize = u8::MAX as usize - CONFIG_OVERHEAD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub signature: [u8; 8],
    pub version: u16,
    pub patch_count: u16,
    pub patches: Vec<Vec<u8>>,
}

impl FirmwareImage {
    /// Build an image from parts. Use [`FirmwareImage::validate`] before trusting it.
    ///
    /// The container counts patches in 16 bits; more than `u16::MAX` is refused.
    pub fn new(
        signature: [u8; 8],
        version: u16,
        patches: Vec<Vec<u8>>,
    ) -> Result<Self, LoadError> {
        let patch_count = u16::try_from(patches.len()).map_err(|_| {
            LoadError::InvalidImage(format!(
                "{} patches exceed the container limit of {}",
                patches.len(),
                u16::MAX
            ))
        })?;
        Ok(Self {
            signature,
            version,
            patch_count,
            patches,
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < IMAGE_HEADER_LEN {
            return Err(LoadError::InvalidImage(format!(
                "{} bytes is shorter than the {} byte header",
                bytes.len(),
                IMAGE_HEADER_LEN
            )));
        }

        let mut signature = [0u8; 8];
        signature.copy_from_slice(&bytes[..8]);
        let version = u16::from_le_bytes([bytes[8], bytes[9]]);
        let patch_count = u16::from_le_bytes([bytes[10], bytes[11]]);
        let patch_length = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;

        let image = Self {
            signature,
            version,
            patch_count,
            patches: Vec::new(),
        };
        image.check_signature()?;

        let body = &bytes[IMAGE_HEADER_LEN..];
        let needed = patch_length
            .checked_mul(patch_count as usize)
            .ok_or_else(|| LoadError::InvalidImage("patch sizes overflow".into()))?;
        if body.len() < needed {
            return Err(LoadError::InvalidImage(format!(
                "{} patches of {} bytes need {} bytes, image has {}",
                patch_count,
                patch_length,
                needed,
                body.len()
            )));
        }
        if body.len() > needed {
            warn!(
                "ignoring {} trailing bytes after {} patches",
                body.len() - needed,
                patch_count
            );
        }

        let patches = if patch_length == 0 {
            vec![Vec::new(); patch_count as usize]
        } else {
            body[..needed]
                .chunks(patch_length)
                .map(<[u8]>::to_vec)
                .collect()
        };

        Ok(Self { patches, ..image })
    }

    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let bytes = fs::read(path)?;
        debug!("read {} bytes of firmware from {}", bytes.len(), path.display());
        Self::parse(&bytes)
    }

    fn check_signature(&self) -> Result<(), LoadError> {
        if &self.signature != RTK_SIGNATURE {
            return Err(LoadError::InvalidImage(format!(
                "signature {:02X?} does not match vendor marker",
                self.signature
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        self.check_signature()?;
        if self.patch_count as usize != self.patches.len() {
            return Err(LoadError::InvalidImage(format!(
                "header declares {} patches, image carries {}",
                self.patch_count,
                self.patches.len()
            )));
        }
        Ok(())
    }

    pub fn total_len(&self) -> usize {
        self.patches.iter().map(Vec::len).sum()
    }

    /// All patches in order, as one byte sequence.
    pub fn patch_bytes(&self) -> Vec<u8> {
        self.patches.concat()
    }
}

/// Controller configuration applied after the patches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlob(pub Vec<u8>);

impl ConfigBlob {
    /// Read the blob; a missing file means no config.
    pub fn from_file(path: &Path) -> Result<Option<Self>, LoadError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(Self(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no config blob at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Download progress after each fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub sent: usize,
    pub total: usize,
    pub fragment: usize,
    pub fragments: usize,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.sent * 100 / self.total) as u8
    }
}

/// Number of download commands for `len` bytes at `max_fragment` per command.
pub fn fragment_count(len: usize, max_fragment: usize) -> usize {
    len.div_ceil(max_fragment.max(1))
}

pub struct FirmwareLoader<'a, S: ByteStream> {
    engine: &'a CommandEngine<S>,
    profile: &'a VendorProfile,
}

impl<'a, S: ByteStream> FirmwareLoader<'a, S> {
    pub fn new(engine: &'a CommandEngine<S>, profile: &'a VendorProfile) -> Self {
        Self { engine, profile }
    }

    fn max_fragment(&self) -> usize {
        self.profile
            .max_fragment
            .clamp(1, u8::MAX as usize - FRAGMENT_OVERHEAD)
    }

    /// Download `image` (and `config`), then launch it.
    ///
    /// Any failure leaves the controller in download mode; it must be reset
    /// before another attempt.
    pub fn load(
        &self,
        image: &FirmwareImage,
        config: Option<&ConfigBlob>,
        mut progress: impl FnMut(Progress),
    ) -> Result<(), LoadError> {
        image.validate()?;
        if let Some(cfg) = config {
            if cfg.len() > MAX_CONFIG_LEN {
                return Err(LoadError::ConfigTooLarge {
                    len: cfg.len(),
                    max: MAX_CONFIG_LEN,
                });
            }
        }

        let timeouts = self.engine.timeouts();
        let data = image.patch_bytes();
        let max_fragment = self.max_fragment();
        let fragments = fragment_count(data.len(), max_fragment);
        info!(
            "downloading firmware v{}: {} patches, {} bytes in {} fragments",
            image.version, image.patch_count, data.len(), fragments
        );

        self.engine
            .send_command(self.profile.download_mode_opcode, &[ENTER_DOWNLOAD])
            .map_err(LoadError::DownloadMode)?;

        let mut sent = 0;
        for (index, chunk) in data.chunks(max_fragment).enumerate() {
            let tag = if index == 0 {
                FRAGMENT_FIRST
            } else {
                FRAGMENT_CONTINUATION
            };
            let mut params = Vec::with_capacity(chunk.len() + FRAGMENT_OVERHEAD);
            params.push(DOWNLOAD_SUBCOMMAND);
            params.push((chunk.len() + 1) as u8);
            params.push(tag);
            params.extend_from_slice(chunk);

            self.engine
                .send_command_with_timeout(self.profile.download_opcode, &params, timeouts.download)
                .map_err(|source| LoadError::FragmentRejected { index, source })?;

            sent += chunk.len();
            progress(Progress {
                sent,
                total: data.len(),
                fragment: index + 1,
                fragments,
            });
        }

        if let Some(cfg) = config.filter(|c| !c.is_empty()) {
            let mut params = Vec::with_capacity(cfg.len() + CONFIG_OVERHEAD);
            params.push(CONFIG_SUBCOMMAND);
            params.push(cfg.len() as u8);
            params.extend_from_slice(&cfg.0);
            self.engine
                .send_command_with_timeout(self.profile.config_opcode, &params, timeouts.download)
                .map_err(LoadError::ConfigRejected)?;
            debug!("applied {} byte config blob", cfg.len());
        }

        self.engine
            .send_command(self.profile.download_mode_opcode, &[LAUNCH])
            .map_err(LoadError::LaunchRejected)?;
        info!("firmware launched");
        Ok(())
    }
}

/// Convenience for callers that only want a percentage.
pub fn log_progress(p: Progress) {
    debug!("firmware download: {}% ({}/{})", p.percent(), p.fragment, p.fragments);
}
