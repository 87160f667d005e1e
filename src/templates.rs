//! Boot and mount configuration templates
//!
//! Every generated file comes from a named template with `{placeholder}`
//! fields. The built-in texts can be replaced from the job configuration;
//! `TemplateSet::validate` rejects replacements that use placeholders the
//! renderer never fills, so a bad template fails at load time rather than
//! producing a half-substituted file.
//!
//! Text outside braces is passed through untouched. In particular arkdep's own
//! `%target%` marker in the boot entry is left for `arkdep deploy` to fill.

use crate::error::{DeployError, Result};
use crate::partitions::PartitionResolver;
use crate::types::UuidKind;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Mapper name the initramfs gives the unlocked root container
pub const ROOT_MAPPER_NAME: &str = "manjaro_root";
/// Mapper name the initramfs gives the unlocked home container
pub const HOME_MAPPER_NAME: &str = "manjaro_home";

/// Mode for generated files that do not exist yet
pub const DEFAULT_FILE_MODE: u32 = 0o644;

const BTRFS_HOME_OPTIONS: &str = "rw,relatime,ssd,discard=async,space_cache=v2,compress=zstd";
const OTHER_HOME_OPTIONS: &str = "rw,relatime,errors=remount-ro";
const SHARED_HOME_OPTIONS: &str =
    "rw,relatime,ssd,discard=async,space_cache=v2,subvol=arkdep/shared/home,compress=zstd";

const SYSTEMD_BOOT: &str = "title Manjaro Summit\n\
linux /arkdep/%target%/vmlinuz\n\
initrd /amd-ucode.img\n\
initrd /intel-ucode.img\n\
initrd /arkdep/%target%/initramfs-linux.img\n\
options root=\"UUID={root_uuid}\" rootflags=subvol=/arkdep/deployments/%target%/rootfs {home_option} lsm=landlock,lockdown,yama,integrity,apparmor,bpf quiet splash loglevel=3 systemd.show_status=auto rd.udev.log_level=3 rw\n";

const LUKS_SYSTEMD_BOOT: &str = "title Manjaro Summit\n\
linux /arkdep/%target%/vmlinuz\n\
initrd /amd-ucode.img\n\
initrd /intel-ucode.img\n\
initrd /arkdep/%target%/initramfs-linux.img\n\
options rd.luks.name={root_uuid}=manjaro_root root=/dev/mapper/manjaro_root rootflags=subvol=/arkdep/deployments/%target%/rootfs {home_option} lsm=landlock,lockdown,yama,integrity,apparmor,bpf quiet splash loglevel=3 systemd.show_status=auto rd.udev.log_level=3 rw\n";

const FSTAB: &str = "UUID=\"{root_fs_uuid}\"\t/root\t\t\tbtrfs\trw,relatime,ssd,discard=async,space_cache=v2,subvol=arkdep/shared/root,compress=zstd\t\t\t0 1\n\
UUID=\"{root_fs_uuid}\"\t/arkdep\t\t\tbtrfs\trw,relatime,ssd,discard=async,space_cache=v2,subvol=arkdep,compress=zstd\t\t\t\t0 1\n\
UUID=\"{root_fs_uuid}\"\t/var/lib/flatpak\tbtrfs\trw,relatime,ssd,discard=async,space_cache=v2,subvol=arkdep/shared/flatpak,compress=zstd\t\t\t0 1\n\
UUID=\"{esp_uuid}\"      \t/boot     \t\tvfat\trw,relatime,fmask=0022,dmask=0022,codepage=437,iocharset=ascii,shortname=mixed,utf8,errors=remount-ro\t0 2\n\
{home_fstab}\n";

const HOME_FSTAB: &str = "UUID=\"{home_fs_uuid}\"\t/home\t\t\t{fs_type}\t{mount_options}\t0 1\n";

const GROUP_FILE: &str = "root:x:0:root\nwheel:x:998:\n";

const LOADER_CONF: &str = "timeout 5\n\
console-mode max\n\
editor yes\n\
auto-entries yes\n\
auto-firmware yes\n";

/// The fixed set of templates the deployment renders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum TemplateName {
    /// Boot entry for an unencrypted root
    SystemdBoot,
    /// Boot entry that unlocks the root container first
    LuksSystemdBoot,
    Fstab,
    /// The `/home` line spliced into `fstab`
    HomeFstab,
    GroupFile,
    LoaderConf,
}

impl TemplateName {
    /// Placeholders the renderer fills for this template
    pub fn placeholders(&self) -> &'static [&'static str] {
        match self {
            Self::SystemdBoot | Self::LuksSystemdBoot => &["root_uuid", "home_option"],
            Self::Fstab => &["root_fs_uuid", "esp_uuid", "home_fstab"],
            Self::HomeFstab => &["home_fs_uuid", "fs_type", "mount_options"],
            Self::GroupFile | Self::LoaderConf => &[],
        }
    }

    /// Built-in template text
    pub fn builtin(&self) -> &'static str {
        match self {
            Self::SystemdBoot => SYSTEMD_BOOT,
            Self::LuksSystemdBoot => LUKS_SYSTEMD_BOOT,
            Self::Fstab => FSTAB,
            Self::HomeFstab => HOME_FSTAB,
            Self::GroupFile => GROUP_FILE,
            Self::LoaderConf => LOADER_CONF,
        }
    }
}

/// Built-in templates plus configured replacements
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    overrides: HashMap<TemplateName, String>,
}

impl TemplateSet {
    /// Build a set from `name -> text` pairs as found in the job configuration.
    ///
    /// Unknown names and unsupported placeholders are rejected.
    pub fn from_overrides(overrides: &BTreeMap<String, String>) -> Result<Self> {
        let mut set = Self::default();
        for (name, text) in overrides {
            let template = TemplateName::from_str(name)
                .map_err(|_| DeployError::template(format!("unknown template '{}'", name)))?;
            set.overrides.insert(template, text.clone());
        }
        set.validate()?;
        Ok(set)
    }

    pub fn text(&self, name: TemplateName) -> &str {
        self.overrides
            .get(&name)
            .map(String::as_str)
            .unwrap_or_else(|| name.builtin())
    }

    /// Check that every template only uses placeholders it will be given
    pub fn validate(&self) -> Result<()> {
        for name in TemplateName::iter() {
            let supported = name.placeholders();
            let unsupported: Vec<&str> = placeholders(self.text(name))
                .into_iter()
                .filter(|p| !supported.contains(p))
                .collect();
            if !unsupported.is_empty() {
                return Err(DeployError::template(format!(
                    "template '{}' uses unsupported placeholder(s): {}",
                    name,
                    unsupported.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Fill the named template with `vars`.
    pub fn render(&self, name: TemplateName, vars: &BTreeMap<&str, String>) -> String {
        render(self.text(name), vars)
    }
}

/// Names of all `{placeholder}` fields in `text`
pub fn placeholders(text: &str) -> BTreeSet<&str> {
    let mut found = BTreeSet::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder_name(&after[..end]) => {
                found.insert(&after[..end]);
                rest = &after[end + 1..];
            }
            _ => rest = after,
        }
    }
    found
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Substitute `{name}` fields of `text` from `vars` in a single pass.
///
/// Substituted values are never rescanned. A field without a value is left
/// as is; that is a bug in the caller and trips a debug assertion.
pub fn render(text: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder_name(&after[..end]) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        debug_assert!(false, "no value for placeholder {{{}}}", name);
                        out.push_str(&rest[start..start + end + 2]);
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn require(value: String, kind: &'static str, mount_point: &str) -> Result<String> {
    if value.is_empty() {
        Err(DeployError::MissingUuid {
            kind,
            mount_point: mount_point.to_string(),
        })
    } else {
        Ok(value)
    }
}

/// Render the systemd-boot entry template for arkdep.
///
/// The LUKS variant is chosen if and only if root is encrypted; it unlocks
/// the root container by its container UUID as `manjaro_root`. An encrypted
/// `/home` adds its own unlock directive to either variant.
pub fn render_boot_entry(resolver: &PartitionResolver, set: &TemplateSet) -> Result<String> {
    let root_uuid = require(resolver.uuid("/", UuidKind::Partition), "root", "/")?;

    let mut home_option = String::new();
    if resolver.is_encrypted("/home") {
        let home_uuid = resolver.uuid("/home", UuidKind::Partition);
        if !home_uuid.is_empty() {
            home_option = format!("rd.luks.name={}={}", home_uuid, HOME_MAPPER_NAME);
        }
    }

    let template = if resolver.is_encrypted("/") {
        TemplateName::LuksSystemdBoot
    } else {
        TemplateName::SystemdBoot
    };
    log::debug!("Using boot entry template {}", template);

    let vars = BTreeMap::from([("root_uuid", root_uuid), ("home_option", home_option)]);
    Ok(set.render(template, &vars))
}

/// Render the `/home` line of the mount table.
///
/// A `/home` record in the partition list gets its own filesystem UUID and
/// type-specific options; without one, home is the shared subvolume on the
/// root filesystem.
pub fn render_home_fstab(
    resolver: &PartitionResolver,
    set: &TemplateSet,
    root_fs_uuid: &str,
) -> Result<String> {
    let vars = if resolver.find("/home").is_some() {
        let fs_type = resolver.filesystem("/home");
        let mount_options = if fs_type == "btrfs" {
            BTRFS_HOME_OPTIONS
        } else {
            OTHER_HOME_OPTIONS
        };
        let home_fs_uuid = require(
            resolver.uuid("/home", UuidKind::Filesystem),
            "filesystem",
            "/home",
        )?;
        BTreeMap::from([
            ("home_fs_uuid", home_fs_uuid),
            ("fs_type", fs_type),
            ("mount_options", mount_options.to_string()),
        ])
    } else {
        BTreeMap::from([
            ("home_fs_uuid", root_fs_uuid.to_string()),
            ("fs_type", "btrfs".to_string()),
            ("mount_options", SHARED_HOME_OPTIONS.to_string()),
        ])
    };
    Ok(set.render(TemplateName::HomeFstab, &vars))
}

/// Render the complete mount table for the deployment overlay
pub fn render_fstab(resolver: &PartitionResolver, set: &TemplateSet) -> Result<String> {
    let root_fs_uuid = require(resolver.uuid("/", UuidKind::Filesystem), "filesystem", "/")?;
    let esp_uuid = require(resolver.uuid("/boot", UuidKind::Partition), "partition", "/boot")?;
    let home_fstab = render_home_fstab(resolver, set, &root_fs_uuid)?;

    let vars = BTreeMap::from([
        ("root_fs_uuid", root_fs_uuid),
        ("esp_uuid", esp_uuid),
        ("home_fstab", home_fstab),
    ]);
    Ok(set.render(TemplateName::Fstab, &vars))
}

/// Render one template the way the deployment would for this layout.
///
/// Both boot entry names yield the variant that matches the root partition.
pub fn render_named(
    resolver: &PartitionResolver,
    set: &TemplateSet,
    name: TemplateName,
) -> Result<String> {
    match name {
        TemplateName::SystemdBoot | TemplateName::LuksSystemdBoot => {
            render_boot_entry(resolver, set)
        }
        TemplateName::Fstab => render_fstab(resolver, set),
        TemplateName::HomeFstab => {
            let root_fs_uuid =
                require(resolver.uuid("/", UuidKind::Filesystem), "filesystem", "/")?;
            render_home_fstab(resolver, set, &root_fs_uuid)
        }
        TemplateName::GroupFile | TemplateName::LoaderConf => {
            Ok(set.render(name, &BTreeMap::new()))
        }
    }
}

/// Write `content` to `path`, creating parent directories as needed.
///
/// The content goes to a temporary file next to the target which is then
/// renamed over it, so readers see either the old file or the complete new
/// one. An existing target keeps its permissions; a new one is created 0644.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let result = (|| {
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        // The temp file starts out 0600; the target keeps its mode or gets 0644
        let permissions = match std::fs::metadata(path) {
            Ok(existing) => existing.permissions(),
            Err(_) => std::fs::Permissions::from_mode(DEFAULT_FILE_MODE),
        };
        tmp.as_file().set_permissions(permissions)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok::<(), std::io::Error>(())
    })();

    match result {
        Ok(()) => {
            log::debug!("Wrote {} ({} bytes)", path.display(), content.len());
            Ok(())
        }
        Err(e) => {
            log::error!("Failed to write {}: {}", path.display(), e);
            Err(DeployError::io(path, e))
        }
    }
}
