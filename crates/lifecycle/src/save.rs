// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Saving a domain's state to a file and bringing it back.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use slog::{info, o, warn};

use platform::{DomainConfig, DomainId, Platform};

use crate::controller::{BringUpMode, ControllerOptions, LifecycleController};

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "save"))
    };
}

/// What happens to the local domain once its state is on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfterSave {
    /// The default: the saved file is now the domain.
    Destroy,
    /// Keep the domain, paused, alongside the file.
    LeavePaused,
    /// Keep the domain running; the file is a point-in-time checkpoint.
    Checkpoint,
}

/// Writes the domain's configuration and state to `path`. On failure the
/// domain is resumed and keeps running; a partial file may be left behind.
pub fn save_domain(
    platform: &dyn Platform,
    domid: DomainId,
    path: &Path,
    after: AfterSave,
    config_override: Option<Vec<u8>>,
) -> Result<()> {
    let config = match config_override {
        Some(bytes) => bytes,
        None => platform
            .retrieve_domain_config(domid)
            .context("failed to retrieve domain configuration")?
            .to_json_bytes()
            .context("failed to serialize domain configuration")?,
    };

    let mut file = File::create(path)
        .with_context(|| format!("failed to create save file {}", path.display()))?;
    savefile::write_save_header(&mut file, &config, true).context("failed to write file header")?;

    info!(sl!(), "saving domain state"; "domid" => domid.0, "path" => path.display().to_string());
    if let Err(e) = platform.suspend_domain(domid, &mut file, false) {
        if let Err(resume_err) = platform.resume_domain(domid) {
            warn!(sl!(), "failed to resume domain {} after failed save: {}",
                domid.0, resume_err);
        }
        return Err(e).context("failed to save domain state");
    }
    file.sync_all()
        .with_context(|| format!("failed to sync save file {}", path.display()))?;

    match after {
        AfterSave::Destroy => platform
            .destroy_domain(domid)
            .context("failed to destroy saved domain")?,
        AfterSave::LeavePaused => {
            // Pause first so resuming from the suspended state does not
            // set the guest running.
            platform
                .pause_domain(domid)
                .context("failed to pause saved domain")?;
            platform
                .resume_domain(domid)
                .context("failed to resume saved domain")?;
        }
        AfterSave::Checkpoint => platform
            .resume_domain(domid)
            .context("failed to resume checkpointed domain")?,
    }
    Ok(())
}

/// Re-creates a domain from a file written by [`save_domain`] and hands it
/// to a lifecycle controller. `config_override` replaces the embedded
/// configuration wholesale when given. Returns the monitor's exit code.
pub fn restore_domain_from_file(
    platform: &dyn Platform,
    path: &Path,
    opts: ControllerOptions,
    config_override: Option<Vec<u8>>,
) -> Result<i32> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open save file {}", path.display()))?;

    let (header, embedded) = savefile::read_save_header(&mut file)
        .with_context(|| format!("unusable save file {}", path.display()))?;

    let config_bytes = config_override.or(embedded).ok_or_else(|| {
        anyhow::anyhow!(
            "save file {} carries no configuration and none was supplied",
            path.display()
        )
    })?;
    let config = DomainConfig::from_json(&config_bytes)
        .context("failed to parse domain configuration")?;

    info!(sl!(), "restoring domain from file";
        "name" => &config.name, "path" => path.display().to_string());

    let mut controller = LifecycleController::new(platform, config, opts);
    controller.run(BringUpMode::Restore {
        stream: &mut file,
        stream_version: header.stream_version(),
        checkpointed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform::fake::FakePlatform;
    use std::io::Read;
    use tempfile::tempdir;

    fn saved_domain(fake: &FakePlatform) -> DomainId {
        fake.set_state_payload(b"memory pages".to_vec());
        fake.add_domain("guest", false)
    }

    fn guest_config_bytes() -> Vec<u8> {
        let config = DomainConfig {
            name: "guest".into(),
            ..Default::default()
        };
        config.to_json_bytes().unwrap()
    }

    #[test]
    fn test_save_writes_header_and_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guest.save");
        let fake = FakePlatform::new();
        let domid = saved_domain(&fake);

        save_domain(&fake, domid, &path, AfterSave::Destroy, Some(guest_config_bytes()))
            .unwrap();
        assert_eq!(fake.num_domains(), 0);

        let mut file = File::open(&path).unwrap();
        let (header, config) = savefile::read_save_header(&mut file).unwrap();
        assert!(header.config_in_json());
        assert_eq!(header.stream_version(), 2);
        assert_eq!(
            DomainConfig::from_json(&config.unwrap()).unwrap().name,
            "guest"
        );

        // The platform state stream follows the header directly.
        let mut rest = Vec::new();
        file.read_to_end(&mut rest).unwrap();
        assert!(!rest.is_empty());
    }

    #[test]
    fn test_save_checkpoint_resumes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guest.save");
        let fake = FakePlatform::new();
        let domid = saved_domain(&fake);

        save_domain(&fake, domid, &path, AfterSave::Checkpoint, Some(guest_config_bytes()))
            .unwrap();

        assert!(fake.domain(domid).is_some());
        assert!(fake.calls().iter().any(|c| c.starts_with("resume")));
    }

    #[test]
    fn test_save_leave_paused_pauses_before_resuming() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guest.save");
        let fake = FakePlatform::new();
        let domid = saved_domain(&fake);

        save_domain(&fake, domid, &path, AfterSave::LeavePaused, Some(guest_config_bytes()))
            .unwrap();

        let calls = fake.calls();
        let pause = calls.iter().position(|c| c.starts_with("pause")).unwrap();
        let resume = calls.iter().position(|c| c.starts_with("resume")).unwrap();
        assert!(pause < resume);
    }

    #[test]
    fn test_failed_save_resumes_domain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guest.save");
        let fake = FakePlatform::new();
        let domid = saved_domain(&fake);
        fake.fail_call("suspend_domain");

        let err = save_domain(&fake, domid, &path, AfterSave::Destroy, Some(guest_config_bytes()))
            .unwrap_err();
        assert!(err.to_string().contains("failed to save"));

        assert!(fake.domain(domid).is_some());
        assert!(fake.calls().iter().any(|c| c.starts_with("resume")));
    }

    #[test]
    fn test_restore_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guest.save");
        let fake = FakePlatform::new();
        fake.set_state_payload(b"memory pages".to_vec());
        let domid = fake.add_domain("guest", false);
        save_domain(&fake, domid, &path, AfterSave::Destroy, Some(guest_config_bytes()))
            .unwrap();

        let opts = ControllerOptions {
            lock_path: dir.path().join("creation-lock"),
            autoballoon: false,
            monitor: false,
            ..Default::default()
        };
        let code = restore_domain_from_file(&fake, &path, opts, None).unwrap();
        assert_eq!(code, 0);

        let (_, domain) = fake.find_domain("guest").unwrap();
        assert!(!domain.paused);
        assert_eq!(fake.ingested_payload().unwrap(), b"memory pages".to_vec());
        let params = fake.restore_params().unwrap();
        assert_eq!(params.stream_version, 2);
        assert!(!params.checkpointed);
    }

    #[test]
    fn test_restore_rejects_configless_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guest.save");
        let mut file = File::create(&path).unwrap();
        savefile::write_save_header(&mut file, &[], true).unwrap();
        drop(file);

        let fake = FakePlatform::new();
        let opts = ControllerOptions {
            lock_path: dir.path().join("creation-lock"),
            autoballoon: false,
            monitor: false,
            ..Default::default()
        };
        let err = restore_domain_from_file(&fake, &path, opts, None).unwrap_err();
        assert!(err.to_string().contains("carries no configuration"));
        assert_eq!(fake.num_domains(), 0);
    }
}
