// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#[cfg(target_os = "linux")]
mod linux_tests {
    use std::process::Command;

    #[test]
    fn fuse_host_binary_help_runs() {
        // Running with --help must not attempt a mount
        let output = Command::new(env!("CARGO_BIN_EXE_scriptfs-fuse-host"))
            .arg("--help")
            .output()
            .expect("able to execute scriptfs-fuse-host");

        assert!(output.status.success(), "--help should succeed");
        let help = String::from_utf8_lossy(&output.stdout);
        assert!(help.contains("--allow-other"));
        assert!(help.contains("--log-level"));
    }

    #[test]
    fn missing_mount_point_is_a_usage_error() {
        let status = Command::new(env!("CARGO_BIN_EXE_scriptfs-fuse-host"))
            .status()
            .expect("able to execute scriptfs-fuse-host");
        assert_eq!(status.code(), Some(2));
    }
}
