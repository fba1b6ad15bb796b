//! Registry of the images loaded in the target process.
//!
//! Images are classified when they are loaded. An image is *interesting* if its name contains,
//! case-insensitively, one of the substrings given on the command line. Memory accesses are only
//! traced inside interesting images, while control-flow is traced everywhere.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use regex as re;

use crate::error::*;
use crate::host::*;

/// A loaded image.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Image {
    /// Name of the image, as reported by the host.
    pub name: String,
    /// Lowest address of the image.
    pub low: u64,
    /// Highest address of the image (inclusive).
    pub high: u64,
    /// `true` if memory accesses in this image are traced.
    pub interesting: bool,
}

impl Image {
    /// Returns `true` if `addr` is inside the image.
    pub fn contains(&self, addr: u64) -> bool {
        self.low <= addr && addr <= self.high
    }
}

/// Loaded images, in load order.
#[derive(Clone, Debug)]
pub struct Images {
    images: Vec<Image>,
    patterns: re::RegexSet,
}

impl Images {
    /// Creates an empty registry. Images whose name contains one of `patterns` are interesting.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = re::RegexSetBuilder::new(
            patterns
                .iter()
                .map(|p| p.as_ref())
                .filter(|p| !p.is_empty())
                .map(re::escape),
        )
        .case_insensitive(true)
        .build()?;
        Ok(Self {
            images: vec![],
            patterns,
        })
    }

    /// Returns `true` if an image called `name` would be classified as interesting.
    pub fn is_interesting(&self, name: &str) -> bool {
        self.patterns.is_match(name)
    }

    /// Classifies and records a newly loaded image.
    pub fn register(&mut self, info: &ImageInfo) -> Result<&Image> {
        if info.low > info.high {
            return Err(ImageError::InvalidRange(info.low, info.high))?;
        }
        let image = Image {
            name: info.name.clone(),
            low: info.low,
            high: info.high,
            interesting: self.is_interesting(&info.name),
        };
        tracing::info!(
            "Image '{}' loaded at {:x} ... {:x}{}",
            image.name,
            image.low,
            image.high,
            if image.interesting {
                " [interesting]"
            } else {
                ""
            }
        );
        self.images.push(image);
        Ok(&self.images[self.images.len() - 1])
    }

    /// Returns the first registered image containing `addr`.
    pub fn image_of(&self, addr: u64) -> Option<&Image> {
        self.images.iter().find(|i| i.contains(addr))
    }

    /// Iterates over the registered images.
    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Log of every image loaded by the target, one image per line:
///
/// ```text
/// <interesting 0|1> <low address> <high address> <name>
/// ```
///
/// It is used offline to map the instruction pointers found in traces back to their images.
#[derive(Debug)]
pub struct ImageLog {
    file: File,
    path: PathBuf,
}

impl ImageLog {
    /// Creates (or truncates) `<prefix>_images.log`.
    pub fn create(prefix: &str) -> Result<Self> {
        let path = PathBuf::from(format!("{}_images.log", prefix));
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `image` to the log and flushes it.
    pub fn append(&mut self, image: &Image) -> Result<()> {
        writeln!(
            self.file,
            "{} {:x} {:x} {}",
            image.interesting as u8, image.low, image.high, image.name
        )?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_classification() {
        let mut images = Images::new(&[".exe", "Crypto.DLL", ""]).unwrap();
        assert!(images.is_interesting("C:\\target\\APP.EXE"));
        assert!(images.is_interesting("c:\\windows\\system32\\crypto.dll"));
        assert!(!images.is_interesting("ntdll.dll"));
        // Patterns are literals.
        assert!(!images.is_interesting("fooexe"));

        images
            .register(&ImageInfo::new("app.exe", 0x400000, 0x40ffff))
            .unwrap();
        images
            .register(&ImageInfo::new("ntdll.dll", 0x7ff000, 0x7fffff))
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images.image_of(0x40ffff).map(|i| i.interesting), Some(true));
        assert_eq!(images.image_of(0x7ff800).map(|i| i.interesting), Some(false));
        assert_eq!(images.image_of(0x410000), None);
        assert_eq!(
            images.register(&ImageInfo::new("bad", 2, 1)).unwrap_err(),
            Error::Image(ImageError::InvalidRange(2, 1))
        );
    }

    #[test]
    fn image_empty_patterns() {
        let images = Images::new::<&str>(&[]).unwrap();
        assert!(!images.is_interesting("app.exe"));
    }

    #[test]
    fn image_log_lines() {
        let dir = std::env::temp_dir().join(format!("leaktrace-image-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let prefix = dir.join("out").to_string_lossy().into_owned();
        let mut log = ImageLog::create(&prefix).unwrap();
        let mut images = Images::new(&["app"]).unwrap();
        let image = images
            .register(&ImageInfo::new("app.exe", 0x1000, 0x1fff))
            .unwrap()
            .clone();
        log.append(&image).unwrap();
        let image = images
            .register(&ImageInfo::new("lib.so", 0x2000, 0x2fff))
            .unwrap()
            .clone();
        log.append(&image).unwrap();
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "1 1000 1fff app.exe\n0 2000 2fff lib.so\n");
    }
}
