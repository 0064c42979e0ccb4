// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel mounts through `fuser::Session`.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use std::io;
use std::path::Path;
use std::sync::Arc;

use fuser::{MountOption, SessionUnmounter};
use parking_lot::Mutex;
use scriptfs_core::{Bridge, MountedChannel, Mounter, SessionOptions, Unmounter};
use tracing::{debug, info};

use crate::adapter::ScriptFsFuse;

const FS_NAME: &str = "scriptfs";

pub fn mount_options(options: &SessionOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::Subtype(FS_NAME.to_string()),
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.allow_root {
        opts.push(MountOption::AllowRoot);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts.push(MountOption::CUSTOM(format!("max_read={}", options.max_read)));
    opts
}

pub struct FuserMounter;

impl Mounter for FuserMounter {
    fn mount(
        &self,
        mountpoint: &Path,
        options: &SessionOptions,
        bridge: Arc<Bridge>,
    ) -> io::Result<Box<dyn MountedChannel>> {
        let filesystem = ScriptFsFuse::new(bridge, options.clone());
        let mut session = fuser::Session::new(filesystem, mountpoint, &mount_options(options))?;
        let unmounter = Arc::new(Mutex::new(session.unmount_callable()));
        info!(mountpoint = %mountpoint.display(), "kernel mount established");
        Ok(Box::new(FuserChannel {
            session: Some(session),
            unmounter,
        }))
    }
}

/// fuser owns the `/dev/fuse` read loop, so the first `receive` runs it to
/// completion and every later call reports the device as gone.
struct FuserChannel {
    session: Option<fuser::Session<ScriptFsFuse>>,
    unmounter: Arc<Mutex<SessionUnmounter>>,
}

impl MountedChannel for FuserChannel {
    fn receive(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        if let Some(mut session) = self.session.take() {
            session.run()?;
            debug!("fuser session loop finished");
        }
        Err(io::Error::from_raw_os_error(libc::ENODEV))
    }

    fn process(&mut self, _request: &[u8]) {}

    fn unmounter(&mut self) -> Box<dyn Unmounter> {
        Box::new(FuserUnmounter(Arc::clone(&self.unmounter)))
    }
}

struct FuserUnmounter(Arc<Mutex<SessionUnmounter>>);

impl Unmounter for FuserUnmounter {
    fn unmount(&mut self) -> io::Result<()> {
        self.0.lock().unmount()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_session_flags() {
        let options = SessionOptions {
            allow_other: true,
            auto_unmount: true,
            max_read: 65536,
            ..SessionOptions::default()
        };
        let opts = mount_options(&options);
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(opts.contains(&MountOption::AutoUnmount));
        assert!(!opts.contains(&MountOption::AllowRoot));
        assert!(opts.contains(&MountOption::CUSTOM("max_read=65536".into())));
    }
}
