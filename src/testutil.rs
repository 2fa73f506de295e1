//! Fixtures shared by the unit tests: synthetic Mach-O images, a throwaway
//! app package and fakes for the injection seams.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use tempfile::TempDir;
use zerocopy::IntoBytes;

use crate::config::{InjectorConfig, Ownership};
use crate::editor::{DependencyEditor, NativeEditor};
use crate::error::{Error, Result};
use crate::injector::Snapshot;
use crate::macho::*;
use crate::trust::TrustBypass;
use crate::util::align_up;

// =============================================================================
// Mach-O Images
// =============================================================================

/// Builds a minimal arm64 image: one `__TEXT` segment with a `__text`
/// section, followed by the requested load commands.
pub struct MachOBuilder {
    filetype: u32,
    id: Option<String>,
    commands: Vec<Vec<u8>>,
    text_offset: u32,
}

impl MachOBuilder {
    const TEXT_SIZE: u32 = 0x100;

    pub fn new() -> Self {
        Self {
            filetype: MH_EXECUTE,
            id: None,
            commands: Vec::new(),
            text_offset: 0x4000,
        }
    }

    /// Turns the image into a dylib identified by `name`.
    pub fn id(mut self, name: &str) -> Self {
        self.filetype = MH_DYLIB;
        self.id = Some(name.to_string());
        self
    }

    pub fn dylib(mut self, name: &str) -> Self {
        self.commands.push(DylibCommand::encode(LC_LOAD_DYLIB, name));
        self
    }

    pub fn weak_dylib(mut self, name: &str) -> Self {
        self.commands.push(DylibCommand::encode(LC_LOAD_WEAK_DYLIB, name));
        self
    }

    pub fn rpath(mut self, path: &str) -> Self {
        self.commands.push(RpathCommand::encode(path));
        self
    }

    /// Moves the first section, which bounds the load-command region.
    pub fn text_offset(mut self, offset: u32) -> Self {
        self.text_offset = offset;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total = (self.text_offset + Self::TEXT_SIZE) as usize;

        let mut segment = SegmentCommand64 {
            cmdsize: (SegmentCommand64::SIZE + Section64::SIZE) as u32,
            vmaddr: 0x1_0000_0000,
            vmsize: align_up(total as u64, 0x4000),
            fileoff: 0,
            filesize: total as u64,
            maxprot: 5,
            initprot: 5,
            nsects: 1,
            ..Default::default()
        };
        segment.set_name("__TEXT");

        let mut section = Section64 {
            addr: 0x1_0000_0000 + self.text_offset as u64,
            size: Self::TEXT_SIZE as u64,
            offset: self.text_offset,
            align: 2,
            ..Default::default()
        };
        section.set_name("__text");
        section.segname = segment.segname;

        let mut commands = Vec::new();
        commands.extend_from_slice(segment.as_bytes());
        commands.extend_from_slice(section.as_bytes());
        let mut ncmds = 1;
        if let Some(id) = &self.id {
            commands.extend_from_slice(&DylibCommand::encode(LC_ID_DYLIB, id));
            ncmds += 1;
        }
        for cmd in &self.commands {
            commands.extend_from_slice(cmd);
            ncmds += 1;
        }

        let header = MachHeader64 {
            cputype: CPU_TYPE_ARM64,
            cpusubtype: CPU_SUBTYPE_ARM64_ALL,
            filetype: self.filetype,
            ncmds,
            sizeofcmds: commands.len() as u32,
            flags: (MachOFlags::NOUNDEFS | MachOFlags::DYLDLINK | MachOFlags::TWOLEVEL | MachOFlags::PIE)
                .bits(),
            ..Default::default()
        };

        let mut data = vec![0u8; total];
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        data[MachHeader64::SIZE..MachHeader64::SIZE + commands.len()].copy_from_slice(&commands);
        data[self.text_offset as usize..].fill(0xAA);
        data
    }
}

/// Wraps thin images into a FAT file with 16 KiB aligned slices.
pub fn fat_binary(slices: &[Vec<u8>]) -> Vec<u8> {
    const ALIGN: u32 = 14;

    let table_end = FatHeader::SIZE + slices.len() * FatArch::SIZE;
    let mut offsets = Vec::with_capacity(slices.len());
    let mut cursor = align_up(table_end as u64, 1 << ALIGN) as usize;
    for slice in slices {
        offsets.push(cursor);
        cursor = align_up((cursor + slice.len()) as u64, 1 << ALIGN) as usize;
    }

    let mut data = vec![0u8; cursor];
    BigEndian::write_u32(&mut data, FAT_MAGIC);
    BigEndian::write_u32(&mut data[4..], slices.len() as u32);
    for (index, (slice, offset)) in slices.iter().zip(&offsets).enumerate() {
        let entry = FatHeader::SIZE + index * FatArch::SIZE;
        BigEndian::write_u32(&mut data[entry..], CPU_TYPE_ARM64);
        BigEndian::write_u32(&mut data[entry + 4..], CPU_SUBTYPE_ARM64_ALL);
        BigEndian::write_u32(&mut data[entry + 8..], *offset as u32);
        BigEndian::write_u32(&mut data[entry + 12..], slice.len() as u32);
        BigEndian::write_u32(&mut data[entry + 16..], ALIGN);
        data[*offset..*offset + slice.len()].copy_from_slice(slice);
    }
    data
}

/// Minimal XML property list naming a bundle executable.
pub fn info_plist(executable: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key>
    <string>com.example.fixture</string>
    <key>CFBundleExecutable</key>
    <string>{executable}</string>
    <key>CFBundlePackageType</key>
    <string>FMWK</string>
</dict>
</plist>
"#
    )
}

// =============================================================================
// App Package
// =============================================================================

/// A temporary app package with a Unity-style target executable and a
/// scratch directory for assets.
pub struct Package {
    _dir: TempDir,
    pub app: PathBuf,
    pub assets: PathBuf,
}

impl Package {
    pub const TEAM_ID: &'static str = "ABCDE12345";

    pub fn new() -> Self {
        Self::with_target(MachOBuilder::new().dylib("/usr/lib/libSystem.B.dylib").build())
    }

    pub fn with_target(image: Vec<u8>) -> Self {
        let pkg = Self::without_target();
        let target = pkg.target();
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, image).unwrap();
        pkg
    }

    pub fn without_target() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Game.app");
        let assets = dir.path().join("assets");
        fs::create_dir_all(app.join("Frameworks")).unwrap();
        fs::create_dir_all(&assets).unwrap();
        Self {
            _dir: dir,
            app,
            assets,
        }
    }

    /// Configuration pointing at this package that leaves ownership alone.
    pub fn config(&self) -> InjectorConfig {
        InjectorConfig::default()
            .with_team_id(Self::TEAM_ID)
            .with_ownership(Ownership::Preserve)
    }

    pub fn target(&self) -> PathBuf {
        InjectorConfig::default().target_in(&self.app)
    }

    pub fn frameworks(&self) -> PathBuf {
        self.app.join("Frameworks")
    }

    pub fn target_bytes(&self) -> Vec<u8> {
        fs::read(self.target()).unwrap()
    }

    pub fn target_dependencies(&self) -> Vec<String> {
        read_dependencies(&self.target())
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect()
    }

    pub fn target_rpaths(&self) -> Vec<String> {
        let file = MachOFile::open(self.target()).unwrap();
        let ctx = file.contexts().unwrap().remove(0);
        ctx.rpaths().map(str::to_string).collect()
    }

    /// Creates `assets/<name>` as a dylib image.
    pub fn dylib(&self, name: &str) -> PathBuf {
        let path = self.assets.join(name);
        let image = MachOBuilder::new()
            .id(&format!("@rpath/{name}"))
            .dylib("/usr/lib/libSystem.B.dylib")
            .build();
        fs::write(&path, image).unwrap();
        path
    }

    /// Creates `assets/<name>` as a framework whose executable is named
    /// after the bundle stem and declared in its Info.plist.
    pub fn framework(&self, name: &str) -> PathBuf {
        let stem = Path::new(name).file_stem().unwrap().to_str().unwrap().to_string();
        self.framework_with_executable(name, &stem)
    }

    pub fn framework_with_executable(&self, name: &str, executable: &str) -> PathBuf {
        let path = self.assets.join(name);
        fs::create_dir_all(path.join("Resources")).unwrap();
        fs::write(path.join("Info.plist"), info_plist(executable)).unwrap();
        fs::write(path.join("Resources/data.bin"), b"resource").unwrap();
        let image = MachOBuilder::new()
            .id(&format!("@rpath/{name}/{executable}"))
            .build();
        fs::write(path.join(executable), image).unwrap();
        path
    }

    /// Creates a framework directory with nothing loadable inside.
    pub fn empty_framework(&self, name: &str) -> PathBuf {
        let path = self.assets.join(name);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("README"), b"not a binary").unwrap();
        path
    }

    /// Creates a resource bundle with a nested file.
    pub fn bundle(&self, name: &str) -> PathBuf {
        let path = self.assets.join(name);
        fs::create_dir_all(path.join("en.lproj")).unwrap();
        fs::write(path.join("en.lproj/Localizable.strings"), b"\"hi\" = \"hi\";").unwrap();
        path
    }
}

// =============================================================================
// Fakes
// =============================================================================

/// Records every executable it is asked to bypass and optionally fails for
/// one file name.
#[derive(Default)]
pub struct RecordingBypass {
    calls: Mutex<Vec<PathBuf>>,
    fail_on: Option<String>,
    fail_after: Option<usize>,
}

impl RecordingBypass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails whenever the executable's file name equals `name`.
    pub fn failing_on(name: &str) -> Self {
        Self {
            fail_on: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Succeeds for the first `count` calls and fails afterwards.
    pub fn failing_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

impl TrustBypass for RecordingBypass {
    fn bypass_signature(&self, executable: &Path, _team_id: &str) -> Result<()> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(executable.to_path_buf());

        let by_name = self
            .fail_on
            .as_deref()
            .is_some_and(|name| executable.file_name().is_some_and(|n| n == name));
        let by_count = self.fail_after.is_some_and(|count| calls.len() > count);
        if by_name || by_count {
            return Err(Error::SignatureBypass {
                path: executable.to_path_buf(),
                message: "rejected by test".into(),
            });
        }
        Ok(())
    }
}

/// Wraps the native editor, failing chosen operations and recording the
/// dependency list seen at each insert.
#[derive(Default)]
pub struct ScriptedEditor {
    inner: NativeEditor,
    fail_insert_of: Option<String>,
    delete_snapshot_on_failure: bool,
    seen_at_insert: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_insert_of(name: &str) -> Self {
        Self {
            fail_insert_of: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Also deletes the target's snapshot when the scripted failure fires,
    /// so the rollback cannot restore it.
    pub fn deleting_snapshot(mut self) -> Self {
        self.delete_snapshot_on_failure = true;
        self
    }

    /// `(inserted name, dependency names present just before the insert)`
    pub fn seen_at_insert(&self) -> Vec<(String, Vec<String>)> {
        self.seen_at_insert.lock().unwrap().clone()
    }
}

impl DependencyEditor for ScriptedEditor {
    fn list_dependencies(&self, binary: &Path) -> Result<Vec<Dependency>> {
        self.inner.list_dependencies(binary)
    }

    fn insert_dependency(&self, binary: &Path, name: &str, weak: bool) -> Result<bool> {
        let present = self
            .inner
            .list_dependencies(binary)?
            .into_iter()
            .map(|d| d.name)
            .collect();
        self.seen_at_insert
            .lock()
            .unwrap()
            .push((name.to_string(), present));

        if self.fail_insert_of.as_deref() == Some(name) {
            if self.delete_snapshot_on_failure {
                fs::remove_file(Snapshot::alternate_path(binary)).unwrap();
            }
            return Err(Error::InsufficientLoadCommandSpace {
                needed: 64,
                available: 0,
            });
        }
        self.inner.insert_dependency(binary, name, weak)
    }

    fn rename_dependency(&self, binary: &Path, from: &str, to: &str) -> Result<()> {
        self.inner.rename_dependency(binary, from, to)
    }

    fn remove_dependency(&self, binary: &Path, name: &str) -> Result<()> {
        self.inner.remove_dependency(binary, name)
    }

    fn insert_runtime_search_path(&self, binary: &Path, path: &str) -> Result<bool> {
        self.inner.insert_runtime_search_path(binary, path)
    }

    fn locate_executable(&self, bundle: &Path) -> Result<PathBuf> {
        self.inner.locate_executable(bundle)
    }

    fn list_candidate_executables(&self, bundle: &Path) -> Result<Vec<PathBuf>> {
        self.inner.list_candidate_executables(bundle)
    }
}
