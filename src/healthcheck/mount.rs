use super::error::{HealthcheckError, Result};
use super::models::FileSystem;

pub const ROOT_DIR: &str = "/";

/// Mount points and block devices backing the MySQL directories of one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageLayout {
    pub mount_points: Vec<String>,
    pub devices: Vec<String>,
}

fn is_path_prefix(mount_point: &str, dir: &str) -> bool {
    if mount_point == ROOT_DIR {
        return dir.starts_with(ROOT_DIR);
    }
    let mount_point = mount_point.trim_end_matches('/');
    match dir.strip_prefix(mount_point) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Returns the longest mount point that contains `dir`.
///
/// Matching is done on whole path components, so `/data` never matches
/// `/data2/mysql`.
pub fn match_mount_point<'a>(dir: &str, mount_points: &'a [String]) -> Result<&'a str> {
    mount_points
        .iter()
        .filter(|mp| is_path_prefix(mp, dir))
        .max_by_key(|mp| mp.trim_end_matches('/').len())
        .map(String::as_str)
        .ok_or_else(|| {
            HealthcheckError::Resolution(format!(
                "could not find mount point of directory {dir}"
            ))
        })
}

/// Resolves the mount point and devices for every MySQL directory plus the
/// OS root directory. Any directory without a matching mount point fails the
/// whole resolution.
pub fn resolve(dirs: &[String], file_systems: &[FileSystem]) -> Result<StorageLayout> {
    let mount_points: Vec<String> = file_systems.iter().map(|fs| fs.mount_point.clone()).collect();
    let mut layout = StorageLayout::default();

    let candidates = dirs
        .iter()
        .map(String::as_str)
        .filter(|d| !d.trim().is_empty())
        .chain(std::iter::once(ROOT_DIR));

    for dir in candidates {
        let mount_point = match_mount_point(dir, &mount_points)?;
        if layout.mount_points.iter().any(|mp| mp == mount_point) {
            continue;
        }
        layout.mount_points.push(mount_point.to_string());
        for fs in file_systems.iter().filter(|fs| fs.mount_point == mount_point) {
            if !layout.devices.contains(&fs.device) {
                layout.devices.push(fs.device.clone());
            }
        }
    }

    Ok(layout)
}
