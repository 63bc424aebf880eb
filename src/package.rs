use std::io::prelude::*;
use std::io::Cursor;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::DfuError;

/// The two buffers uploaded by one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePackage {
    /// Init packet; absent for a bare image, which skips the init phase.
    pub init_data: Option<Vec<u8>>,
    pub image_data: Vec<u8>,
}

impl FirmwarePackage {
    pub fn new(init_data: Option<Vec<u8>>, image_data: Vec<u8>) -> Result<Self, DfuError> {
        let package = Self { init_data, image_data };
        package.validate()?;
        Ok(package)
    }

    pub fn validate(&self) -> Result<(), DfuError> {
        if self.image_data.is_empty() {
            return Err(DfuError::Format("firmware image is empty".into()));
        }
        if self.init_data.as_ref().is_some_and(Vec::is_empty) {
            return Err(DfuError::Format("init packet is empty".into()));
        }
        Ok(())
    }
}

/// Anything able to produce a [`FirmwarePackage`].
pub trait PackageSource {
    fn load(&self) -> Result<FirmwarePackage, DfuError>;
}

/// A package on disk: either a bare `.bin` image or a DFU zip archive.
pub struct PackageFile {
    path: PathBuf,
}

impl PackageFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PackageSource for PackageFile {
    fn load(&self) -> Result<FirmwarePackage, DfuError> {
        let bytes = std::fs::read(&self.path)?;
        let is_bin = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));
        let package = if is_bin {
            FirmwarePackage::new(None, bytes)?
        } else {
            extract(bytes)?
        };
        info!(
            path = %self.path.display(),
            init = package.init_data.as_ref().map_or(0, Vec::len),
            image = package.image_data.len(),
            "Loaded firmware package"
        );
        Ok(package)
    }
}

/// Pull the init packet and image out of a DFU zip archive.
pub fn extract(archive: Vec<u8>) -> Result<FirmwarePackage, DfuError> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;

    let has_manifest = zip.file_names().any(|name| name == "manifest.json");
    let (dat_name, bin_name) = if has_manifest {
        let manifest_raw = zip.by_name("manifest.json")?;
        let manifest: serde_json::Value = serde_json::from_reader(manifest_raw)?;
        from_manifest(&manifest)?
    } else {
        by_extension(&zip)?
    };
    debug!(dat = %dat_name, bin = %bin_name, "Package entries");

    let mut dat = Vec::new();
    zip.by_name(&dat_name)?.read_to_end(&mut dat)?;

    let mut bin = Vec::new();
    zip.by_name(&bin_name)?.read_to_end(&mut bin)?;

    FirmwarePackage::new(Some(dat), bin)
}

fn from_manifest(manifest: &serde_json::Value) -> Result<(String, String), DfuError> {
    let app = &manifest["manifest"]["application"];
    if !app.is_object() {
        let kinds: Vec<&str> = manifest["manifest"]
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        return Err(DfuError::Format(format!(
            "only application packages are supported, manifest has {:?}",
            kinds
        )));
    }
    let entry = |key: &str| {
        app[key]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| DfuError::Format(format!("manifest application has no {}", key)))
    };
    Ok((entry("dat_file")?, entry("bin_file")?))
}

fn by_extension<R: Read + Seek>(zip: &zip::ZipArchive<R>) -> Result<(String, String), DfuError> {
    let find = |ext: &str| {
        zip.file_names()
            .find(|name| name.to_ascii_lowercase().ends_with(ext))
            .map(str::to_owned)
            .ok_or_else(|| DfuError::Format(format!("archive has no {} entry", ext)))
    };
    Ok((find(".dat")?, find(".bin")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    const MANIFEST: &[u8] =
        br#"{"manifest":{"application":{"bin_file":"app.bin","dat_file":"app.dat"}}}"#;

    #[test]
    fn test_extract_with_manifest() {
        let zip = archive(&[
            ("manifest.json", MANIFEST),
            ("app.dat", &[1, 2, 3]),
            ("app.bin", &[9; 100]),
            ("other.bin", &[7; 10]),
        ]);
        let package = extract(zip).unwrap();
        assert_eq!(package.init_data, Some(vec![1, 2, 3]));
        assert_eq!(package.image_data, vec![9; 100]);
    }

    #[test]
    fn test_extract_without_manifest_uses_extensions() {
        let zip = archive(&[("FW.BIN", &[5; 64]), ("fw.dat", &[4; 8])]);
        let package = extract(zip).unwrap();
        assert_eq!(package.init_data, Some(vec![4; 8]));
        assert_eq!(package.image_data.len(), 64);
    }

    #[test]
    fn test_softdevice_manifest_rejected() {
        let manifest = br#"{"manifest":{"softdevice":{"bin_file":"sd.bin","dat_file":"sd.dat"}}}"#;
        let zip = archive(&[("manifest.json", manifest), ("sd.dat", &[1]), ("sd.bin", &[1])]);
        assert!(matches!(extract(zip), Err(DfuError::Format(_))));
    }

    #[test]
    fn test_missing_image_rejected() {
        let zip = archive(&[("fw.dat", &[4; 8])]);
        assert!(matches!(extract(zip), Err(DfuError::Format(_))));
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(extract(vec![0u8; 32]), Err(DfuError::Format(_))));
    }

    #[test]
    fn test_empty_buffers_rejected() {
        assert!(FirmwarePackage::new(None, vec![]).is_err());
        assert!(FirmwarePackage::new(Some(vec![]), vec![1]).is_err());
        assert!(FirmwarePackage::new(None, vec![1]).is_ok());
    }

    #[test]
    fn test_bin_file_is_image_only() {
        let path = std::env::temp_dir().join(format!("secure-dfu-{}.bin", std::process::id()));
        std::fs::write(&path, [0xAB; 300]).unwrap();
        let package = PackageFile::new(&path).load();
        std::fs::remove_file(&path).ok();
        let package = package.unwrap();
        assert_eq!(package.init_data, None);
        assert_eq!(package.image_data.len(), 300);
    }
}
