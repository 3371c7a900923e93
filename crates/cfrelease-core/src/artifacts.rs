//! Build directory scanning and artifact placement.
//!
//! Every release lives in `<build_path>/<version>/` and holds a full
//! configuration file (`1Cv8.cf`) plus an update file (`1Cv8.cfu`). The
//! update file is built against the most recent previous releases.

use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, instrument};

/// File name of the full configuration artifact.
pub const CF_FILE: &str = "1Cv8.cf";

/// File name of the update artifact.
pub const CFU_FILE: &str = "1Cv8.cfu";

/// A previous release directory that can feed the update file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCandidate {
    /// Directory name under the build path (usually a version).
    pub name: String,
    /// Last modification time of the directory.
    pub modified: SystemTime,
}

/// Paths of the two artifacts of one release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Full configuration file.
    pub cf: Utf8PathBuf,
    /// Update file.
    pub cfu: Utf8PathBuf,
}

/// Where the artifacts of `version` live under `root`.
pub fn artifact_paths(root: &Utf8Path, version: &str) -> ArtifactPaths {
    let dir = root.join(version);
    ArtifactPaths {
        cf: dir.join(CF_FILE),
        cfu: dir.join(CFU_FILE),
    }
}

/// List subdirectories of `build_path`, newest first.
///
/// Plain files are skipped. A directory entry whose name is not valid
/// UTF-8 is an error.
#[instrument(skip_all, fields(build_path = %build_path))]
pub fn list_build_candidates(build_path: &Utf8Path) -> std::io::Result<Vec<BuildCandidate>> {
    let mut candidates = Vec::new();
    for entry in build_path.read_dir_utf8()? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_dir() {
            continue;
        }
        candidates.push(BuildCandidate {
            name: entry.file_name().to_string(),
            modified: metadata.modified()?,
        });
    }
    sort_newest_first(&mut candidates);
    debug!(count = candidates.len(), "build candidates found");
    Ok(candidates)
}

/// Sort candidates by modification time, newest first.
pub fn sort_newest_first(candidates: &mut [BuildCandidate]) {
    candidates.sort_by(|a, b| b.modified.cmp(&a.modified));
}

/// Take the `count` most recent candidates from an already sorted list.
pub fn select_recent(candidates: &[BuildCandidate], count: usize) -> &[BuildCandidate] {
    &candidates[..count.min(candidates.len())]
}

/// Designer arguments that create the artifacts of `version` as an update
/// over `previous`.
pub fn distribution_args(build_path: &Utf8Path, version: &str, previous: &[BuildCandidate]) -> Vec<String> {
    let target = artifact_paths(build_path, version);
    let mut args = vec![
        "/CreateDistributionFiles".to_string(),
        format!("-cffile {}", target.cf),
        format!("-cfufile {}", target.cfu),
    ];
    args.extend(
        previous
            .iter()
            .map(|c| format!("-f {}", build_path.join(&c.name).join(CF_FILE))),
    );
    args
}

/// Copy both artifacts into a new `<net_path>/<version>` directory.
///
/// The target directory must not exist yet.
#[instrument(skip(artifacts))]
pub fn copy_to_share(artifacts: &ArtifactPaths, net_path: &Utf8Path, version: &str) -> std::io::Result<Utf8PathBuf> {
    let target_dir = net_path.join(version);
    std::fs::create_dir(&target_dir)?;
    let target = artifact_paths(net_path, version);
    std::fs::copy(&artifacts.cf, &target.cf)?;
    std::fs::copy(&artifacts.cfu, &target.cfu)?;
    debug!(target = %target_dir, "artifacts copied");
    Ok(target_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn candidate(name: &str, secs: u64) -> BuildCandidate {
        BuildCandidate {
            name: name.to_string(),
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    #[test]
    fn selects_most_recent_first() {
        let mut candidates = vec![candidate("a", 3), candidate("b", 1), candidate("c", 2)];
        sort_newest_first(&mut candidates);

        let picked: Vec<&str> = select_recent(&candidates, 2).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(picked, ["a", "c"]);
    }

    #[test]
    fn select_more_than_available() {
        let candidates = vec![candidate("only", 1)];
        assert_eq!(select_recent(&candidates, 5).len(), 1);
        assert!(select_recent(&candidates, 0).is_empty());
    }

    #[test]
    fn distribution_args_list_previous_cf_files() {
        let previous = [candidate("1.0.0.3", 3), candidate("1.0.0.2", 2)];
        let args = distribution_args(Utf8Path::new("/builds"), "1.0.0.4", &previous);
        assert_eq!(
            args,
            [
                "/CreateDistributionFiles",
                "-cffile /builds/1.0.0.4/1Cv8.cf",
                "-cfufile /builds/1.0.0.4/1Cv8.cfu",
                "-f /builds/1.0.0.3/1Cv8.cf",
                "-f /builds/1.0.0.2/1Cv8.cf",
            ]
        );
    }

    #[test]
    fn listing_skips_files() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        std::fs::create_dir(root.join("1.0.0.1")).unwrap();
        std::fs::create_dir(root.join("1.0.0.2")).unwrap();
        std::fs::write(root.join("notes.txt"), "x").unwrap();

        let mut names: Vec<String> = list_build_candidates(&root)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        assert_eq!(names, ["1.0.0.1", "1.0.0.2"]);
    }

    #[cfg(unix)]
    #[test]
    fn listing_orders_directories_by_mtime() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        for (name, secs) in [("1.0.0.1", 2_000), ("1.0.0.2", 1_000), ("1.0.0.10", 3_000)] {
            let dir = root.join(name);
            std::fs::create_dir(&dir).unwrap();
            std::fs::File::open(&dir)
                .unwrap()
                .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
                .unwrap();
        }

        let candidates = list_build_candidates(&root).unwrap();
        let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["1.0.0.10", "1.0.0.1", "1.0.0.2"]);

        let picked: Vec<&str> = select_recent(&candidates, 2).iter().map(|c| c.name.as_str()).collect();
        assert_eq!(picked, ["1.0.0.10", "1.0.0.1"]);
    }

    #[test]
    fn copy_refuses_existing_target() {
        let tmp = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let build = root.join("build");
        let net = root.join("net");
        let artifacts = artifact_paths(&build, "1.0.0.2");
        std::fs::create_dir_all(build.join("1.0.0.2")).unwrap();
        std::fs::write(&artifacts.cf, "cf").unwrap();
        std::fs::write(&artifacts.cfu, "cfu").unwrap();
        std::fs::create_dir_all(&net).unwrap();

        let target = copy_to_share(&artifacts, &net, "1.0.0.2").unwrap();
        assert_eq!(std::fs::read_to_string(target.join(CFU_FILE)).unwrap(), "cfu");

        let again = copy_to_share(&artifacts, &net, "1.0.0.2").unwrap_err();
        assert_eq!(again.kind(), std::io::ErrorKind::AlreadyExists);
    }
}
