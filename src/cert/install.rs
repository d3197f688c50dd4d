//! Trust-store integration
//!
//! Thin wrapper over the platform certificate tooling: detect the
//! platform, check whether the CA is trusted, attempt install/uninstall,
//! and render the equivalent shell/batch script for users who prefer to
//! run it themselves (or when the attempt needs privileges we don't have).

use std::process::Command;

use serde::Serialize;
use tracing::{info, warn};

use super::authority::CaStore;

/// Anchor file name used on Linux.
const LINUX_ANCHOR_NAME: &str = "proxyman-ca.crt";

/// Result of an install or uninstall attempt, in the shape the API
/// reports.
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutcome {
    pub success: bool,
    #[serde(rename = "requiresRoot")]
    pub requires_root: bool,
    pub message: String,
}

/// Human-readable platform label, `linux (<distro>)` when detectable.
pub fn platform_label() -> String {
    if cfg!(target_os = "linux") {
        match detect_linux_distro() {
            Some(distro) => format!("linux ({distro})"),
            None => "linux".to_string(),
        }
    } else if cfg!(target_os = "macos") {
        "darwin".to_string()
    } else if cfg!(target_os = "windows") {
        "windows".to_string()
    } else {
        "unknown".to_string()
    }
}

fn detect_linux_distro() -> Option<String> {
    let contents = std::fs::read_to_string("/etc/os-release").ok()?;
    let lower = contents.to_lowercase();
    for distro in ["ubuntu", "debian", "centos", "fedora", "rhel"] {
        if lower.contains(distro) {
            return Some(distro.to_string());
        }
    }
    None
}

/// Whether the CA appears in the platform trust store.
pub fn is_installed(ca: &CaStore) -> bool {
    if !ca.cert_exists() {
        return false;
    }
    if cfg!(target_os = "macos") {
        Command::new("security")
            .args(["find-certificate", "-a", "-c", "ProxyMan", "-Z"])
            .arg("/Library/Keychains/System.keychain")
            .output()
            .map(|out| {
                let text = String::from_utf8_lossy(&out.stdout).to_lowercase();
                text.contains(ca.sha1_fingerprint())
            })
            .unwrap_or(false)
    } else if cfg!(target_os = "windows") {
        Command::new("certutil")
            .args(["-verifystore", "ROOT", "ProxyMan"])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    } else {
        linux_anchor_paths()
            .iter()
            .any(|path| std::path::Path::new(path).exists())
    }
}

fn linux_anchor_paths() -> [String; 2] {
    [
        format!("/usr/local/share/ca-certificates/{LINUX_ANCHOR_NAME}"),
        format!("/etc/pki/ca-trust/source/anchors/{LINUX_ANCHOR_NAME}"),
    ]
}

/// Attempts to add the CA to the system trust store.
pub fn install(ca: &CaStore) -> InstallOutcome {
    let cert_path = ca.cert_path().to_string_lossy().into_owned();
    let outcome = if cfg!(target_os = "macos") {
        run_checked(Command::new("security").args([
            "add-trusted-cert",
            "-d",
            "-r",
            "trustRoot",
            "-k",
            "/Library/Keychains/System.keychain",
            cert_path.as_str(),
        ]))
    } else if cfg!(target_os = "windows") {
        run_checked(Command::new("certutil").args([
            "-addstore",
            "-f",
            "ROOT",
            cert_path.as_str(),
        ]))
    } else {
        linux_install(ca)
    };

    match outcome {
        Ok(()) => {
            info!("CA certificate installed into system trust store");
            InstallOutcome {
                success: true,
                requires_root: false,
                message: "Certificate installed".to_string(),
            }
        }
        Err(message) => {
            warn!(error = %message, "trust store install failed");
            InstallOutcome {
                success: false,
                requires_root: true,
                message,
            }
        }
    }
}

/// Attempts to remove the CA from the trust store and deletes the
/// persisted key pair, so an install followed by an uninstall leaves no
/// CA material behind.
pub fn uninstall(ca: &CaStore) -> InstallOutcome {
    let outcome = if cfg!(target_os = "macos") {
        run_checked(Command::new("security").args([
            "delete-certificate",
            "-c",
            "ProxyMan",
            "/Library/Keychains/System.keychain",
        ]))
    } else if cfg!(target_os = "windows") {
        run_checked(Command::new("certutil").args(["-delstore", "ROOT", "ProxyMan"]))
    } else {
        linux_uninstall()
    };

    if let Err(err) = ca.uninstall() {
        return InstallOutcome {
            success: false,
            requires_root: false,
            message: format!("Failed to remove CA files: {err}"),
        };
    }

    match outcome {
        Ok(()) => {
            info!("CA certificate removed from system trust store");
            InstallOutcome {
                success: true,
                requires_root: false,
                message: "Certificate uninstalled".to_string(),
            }
        }
        Err(message) => {
            warn!(error = %message, "trust store uninstall failed");
            InstallOutcome {
                success: false,
                requires_root: true,
                message,
            }
        }
    }
}

fn linux_install(ca: &CaStore) -> Result<(), String> {
    let cert_path = ca.cert_path();
    let [debian_anchor, rhel_anchor] = linux_anchor_paths();
    if std::path::Path::new("/usr/local/share/ca-certificates").exists() {
        std::fs::copy(&cert_path, &debian_anchor).map_err(|e| e.to_string())?;
        run_checked(&mut Command::new("update-ca-certificates"))
    } else if std::path::Path::new("/etc/pki/ca-trust/source/anchors").exists() {
        std::fs::copy(&cert_path, &rhel_anchor).map_err(|e| e.to_string())?;
        run_checked(Command::new("update-ca-trust").arg("extract"))
    } else {
        Err("no known trust store directory found".to_string())
    }
}

fn linux_uninstall() -> Result<(), String> {
    let mut removed = false;
    for anchor in linux_anchor_paths() {
        if std::path::Path::new(&anchor).exists() {
            std::fs::remove_file(&anchor).map_err(|e| e.to_string())?;
            removed = true;
        }
    }
    if !removed {
        return Ok(());
    }
    if std::path::Path::new("/usr/sbin/update-ca-certificates").exists()
        || std::path::Path::new("/usr/bin/update-ca-certificates").exists()
    {
        run_checked(&mut Command::new("update-ca-certificates"))
    } else {
        run_checked(Command::new("update-ca-trust").arg("extract"))
    }
}

fn run_checked(command: &mut Command) -> Result<(), String> {
    let output = command.output().map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

/// A downloadable script: contents, suggested filename, content type.
pub struct TrustScript {
    pub body: String,
    pub filename: &'static str,
    pub content_type: &'static str,
}

pub fn install_script(ca: &CaStore) -> TrustScript {
    let cert_path = ca.cert_path().to_string_lossy().into_owned();
    if cfg!(target_os = "windows") {
        TrustScript {
            body: format!(
                "@echo off\r\nrem Install the ProxyMan root certificate\r\ncertutil -addstore -f ROOT \"{cert_path}\"\r\n"
            ),
            filename: "install-cert.bat",
            content_type: "application/x-bat",
        }
    } else if cfg!(target_os = "macos") {
        TrustScript {
            body: format!(
                "#!/bin/sh\n# Install the ProxyMan root certificate\nset -e\nsudo security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain \"{cert_path}\"\necho \"Certificate installed.\"\n"
            ),
            filename: "install-cert.sh",
            content_type: "application/x-sh",
        }
    } else {
        TrustScript {
            body: format!(
                "#!/bin/sh\n# Install the ProxyMan root certificate\nset -e\nif [ -d /usr/local/share/ca-certificates ]; then\n    sudo cp \"{cert_path}\" /usr/local/share/ca-certificates/{LINUX_ANCHOR_NAME}\n    sudo update-ca-certificates\nelse\n    sudo cp \"{cert_path}\" /etc/pki/ca-trust/source/anchors/{LINUX_ANCHOR_NAME}\n    sudo update-ca-trust extract\nfi\necho \"Certificate installed.\"\n"
            ),
            filename: "install-cert.sh",
            content_type: "application/x-sh",
        }
    }
}

pub fn uninstall_script(_ca: &CaStore) -> TrustScript {
    if cfg!(target_os = "windows") {
        TrustScript {
            body: "@echo off\r\nrem Remove the ProxyMan root certificate\r\ncertutil -delstore ROOT ProxyMan\r\n"
                .to_string(),
            filename: "uninstall-cert.bat",
            content_type: "application/x-bat",
        }
    } else if cfg!(target_os = "macos") {
        TrustScript {
            body: "#!/bin/sh\n# Remove the ProxyMan root certificate\nset -e\nsudo security delete-certificate -c ProxyMan /Library/Keychains/System.keychain\necho \"Certificate removed.\"\n"
                .to_string(),
            filename: "uninstall-cert.sh",
            content_type: "application/x-sh",
        }
    } else {
        TrustScript {
            body: format!(
                "#!/bin/sh\n# Remove the ProxyMan root certificate\nset -e\nsudo rm -f /usr/local/share/ca-certificates/{LINUX_ANCHOR_NAME} /etc/pki/ca-trust/source/anchors/{LINUX_ANCHOR_NAME}\nif command -v update-ca-certificates >/dev/null; then\n    sudo update-ca-certificates\nelse\n    sudo update-ca-trust extract\nfi\necho \"Certificate removed.\"\n"
            ),
            filename: "uninstall-cert.sh",
            content_type: "application/x-sh",
        }
    }
}
