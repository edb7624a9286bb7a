use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const QCOW2_MAGIC: &[u8] = b"QFI\xfb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Raw,
    Qcow2,
}

impl ImageFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        match ext.to_lowercase().as_str() {
            "raw" | "img" => Some(Self::Raw),
            "qcow2" => Some(Self::Qcow2),
            _ => None,
        }
    }

    /// Reads the image header; anything that is not qcow2 is raw.
    pub fn from_header(file: &mut impl Read) -> std::io::Result<Self> {
        let mut magic = Vec::with_capacity(QCOW2_MAGIC.len());
        file.take(QCOW2_MAGIC.len() as u64).read_to_end(&mut magic)?;
        Ok(if magic == QCOW2_MAGIC {
            Self::Qcow2
        } else {
            Self::Raw
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        }
    }
}

/// Bus a drive is attached to in the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveInterface {
    #[default]
    Ide,
    Virtio,
    Scsi,
}

impl DriveInterface {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveInterface::Ide => "ide",
            DriveInterface::Virtio => "virtio",
            DriveInterface::Scsi => "scsi",
        }
    }
}

impl FromStr for DriveInterface {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ide" => Ok(Self::Ide),
            "virtio" => Ok(Self::Virtio),
            "scsi" => Ok(Self::Scsi),
            other => Err(Error::InvalidConfig(format!(
                "unknown drive interface '{other}' (expected ide, virtio or scsi)"
            ))),
        }
    }
}

impl fmt::Display for DriveInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveMedia {
    #[default]
    Disk,
    Cdrom,
}

impl DriveMedia {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveMedia::Disk => "disk",
            DriveMedia::Cdrom => "cdrom",
        }
    }
}

/// A storage volume attached to a machine when it is created.
///
/// The backing file must exist and be readable when the drive is built.
/// Format is inferred from the file extension (`.raw`, `.img`, `.qcow2`);
/// for any other name the file header decides. Use
/// [`with_format`](Self::with_format) to override either.
/// Machines never delete or modify the backing file of an ephemeral drive;
/// they write to a throwaway overlay instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Drive {
    path: PathBuf,
    format: ImageFormat,
    interface: DriveInterface,
    media: DriveMedia,
    index: Option<u32>,
    read_only: bool,
}

impl Drive {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path).map_err(|e| {
            Error::InvalidConfig(format!("drive file {} is not accessible: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(Error::InvalidConfig(format!(
                "drive file {} is not a regular file",
                path.display()
            )));
        }
        let unreadable = |e: std::io::Error| {
            Error::InvalidConfig(format!("drive file {} is not readable: {e}", path.display()))
        };
        let mut file = std::fs::File::open(&path).map_err(unreadable)?;

        let format = match ImageFormat::from_extension(&path) {
            Some(format) => format,
            None => ImageFormat::from_header(&mut file).map_err(unreadable)?,
        };
        Ok(Self {
            path,
            format,
            interface: DriveInterface::default(),
            media: DriveMedia::default(),
            index: None,
            read_only: false,
        })
    }

    pub fn with_interface(mut self, interface: DriveInterface) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_media(mut self, media: DriveMedia) -> Self {
        self.media = media;
        self
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn interface(&self) -> DriveInterface {
        self.interface
    }

    pub fn media(&self) -> DriveMedia {
        self.media
    }

    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image(suffix: &str) -> NamedTempFile {
        tempfile::Builder::new().suffix(suffix).tempfile().unwrap()
    }

    mod image_format {
        use super::*;

        #[test]
        fn from_extension_raw_and_img() {
            assert_eq!(
                ImageFormat::from_extension(Path::new("disk.raw")),
                Some(ImageFormat::Raw)
            );
            assert_eq!(
                ImageFormat::from_extension(Path::new("disk.img")),
                Some(ImageFormat::Raw)
            );
        }

        #[test]
        fn from_extension_qcow2_case_insensitive() {
            assert_eq!(
                ImageFormat::from_extension(Path::new("disk.QCOW2")),
                Some(ImageFormat::Qcow2)
            );
        }

        #[test]
        fn from_extension_unknown() {
            assert_eq!(ImageFormat::from_extension(Path::new("disk.vmdk")), None);
            assert_eq!(ImageFormat::from_extension(Path::new("disk")), None);
        }
    }

    mod drive_interface {
        use super::*;

        #[test]
        fn parses_known_buses() {
            assert_eq!("ide".parse::<DriveInterface>().unwrap(), DriveInterface::Ide);
            assert_eq!(
                "VIRTIO".parse::<DriveInterface>().unwrap(),
                DriveInterface::Virtio
            );
            assert_eq!("scsi".parse::<DriveInterface>().unwrap(), DriveInterface::Scsi);
        }

        #[test]
        fn rejects_unknown_bus() {
            let err = "floppy".parse::<DriveInterface>().unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)));
        }

        #[test]
        fn serializes_lowercase() {
            assert_eq!(
                serde_json::to_string(&DriveInterface::Virtio).unwrap(),
                "\"virtio\""
            );
        }
    }

    mod drive {
        use super::*;

        #[test]
        fn new_infers_format_and_defaults() {
            let file = image(".qcow2");
            let drive = Drive::new(file.path()).unwrap();
            assert_eq!(drive.path(), file.path());
            assert_eq!(drive.format(), ImageFormat::Qcow2);
            assert_eq!(drive.interface(), DriveInterface::Ide);
            assert_eq!(drive.media(), DriveMedia::Disk);
            assert_eq!(drive.index(), None);
            assert!(!drive.is_read_only());
        }

        #[test]
        fn unknown_extension_reads_the_header() {
            let mut qcow2 = image("");
            qcow2.write_all(b"QFI\xfb\x00\x00\x00\x03").unwrap();
            assert_eq!(Drive::new(qcow2.path()).unwrap().format(), ImageFormat::Qcow2);

            let mut iso = image(".iso");
            iso.write_all(&[0u8; 64]).unwrap();
            assert_eq!(Drive::new(iso.path()).unwrap().format(), ImageFormat::Raw);

            let empty = image(".disk");
            assert_eq!(Drive::new(empty.path()).unwrap().format(), ImageFormat::Raw);
        }

        #[test]
        fn extension_wins_over_header() {
            let mut file = image(".img");
            file.write_all(b"QFI\xfb").unwrap();
            assert_eq!(Drive::new(file.path()).unwrap().format(), ImageFormat::Raw);
        }

        #[test]
        fn new_rejects_missing_file() {
            let err = Drive::new("/nonexistent/weaver/disk.qcow2").unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)));
        }

        #[test]
        fn new_rejects_directory() {
            let dir = tempfile::tempdir().unwrap();
            let err = Drive::new(dir.path()).unwrap_err();
            assert!(err.to_string().contains("not a regular file"));
        }

        #[test]
        fn builder_methods_chain() {
            let file = image(".img");
            let drive = Drive::new(file.path())
                .unwrap()
                .with_interface(DriveInterface::Virtio)
                .with_media(DriveMedia::Cdrom)
                .with_format(ImageFormat::Qcow2)
                .with_index(2)
                .read_only();
            assert_eq!(drive.interface(), DriveInterface::Virtio);
            assert_eq!(drive.media(), DriveMedia::Cdrom);
            assert_eq!(drive.format(), ImageFormat::Qcow2);
            assert_eq!(drive.index(), Some(2));
            assert!(drive.is_read_only());
        }
    }
}
