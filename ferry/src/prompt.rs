use anyhow::Result;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Password, Select};
use ferry_common::{
    AsyncReply, AsyncRequestKind, CertificateRequest, FileExistsAction, FileExistsRequest,
    HostKeyRequest, InsecureReason, Secret, TransferDirection,
};
use tracing::*;

/// Answers the questions an operation asks while it runs.
pub trait Prompter: Send + Sync {
    fn answer(&self, request: &AsyncRequestKind) -> Result<AsyncReply>;

    fn password(&self, prompt: &str) -> Result<Option<String>>;
}

#[derive(Default)]
pub struct Interactive {
    theme: ColorfulTheme,
}

impl Interactive {
    fn trust(&self, prompt: &str) -> Result<(bool, bool)> {
        let choice = Select::with_theme(&self.theme)
            .with_prompt(prompt)
            .items(&["Trust this time", "Always trust", "Reject"])
            .default(2)
            .interact()?;
        Ok((choice != 2, choice == 1))
    }

    fn host_key(&self, request: &HostKeyRequest) -> Result<AsyncReply> {
        if request.changed {
            warn!(
                host = %request.host,
                port = request.port,
                "The host key differs from the one trusted before"
            );
        }
        eprintln!(
            "Host key fingerprint of {}:{}\n  {}",
            request.host, request.port, request.fingerprint
        );
        let (trust, always) = self.trust("Trust this host key?")?;
        Ok(AsyncReply::HostKey { trust, always })
    }

    fn certificate(&self, request: &CertificateRequest) -> Result<AsyncReply> {
        eprintln!(
            "Certificate of {}:{} ({}, {})",
            request.host, request.port, request.protocol_version, request.cipher
        );
        if let Some(error) = &request.verification_error {
            eprintln!("  Verification failed: {error}");
        }
        for cert in &request.chain {
            eprintln!("  Subject: {}", cert.subject);
            eprintln!("  Issuer:  {}", cert.issuer);
            if let (Some(from), Some(to)) = (cert.not_before, cert.not_after) {
                eprintln!("  Valid:   {} - {}", from.date_naive(), to.date_naive());
            }
            eprintln!("  SHA-256: {}", cert.fingerprint_sha256);
        }
        let (trust, always) = self.trust("Trust this certificate?")?;
        Ok(AsyncReply::Certificate { trust, always })
    }

    fn file_exists(&self, request: &FileExistsRequest) -> Result<AsyncReply> {
        let target = match request.direction {
            TransferDirection::Download => request.local.clone(),
            TransferDirection::Upload => request.remote_path.format_filename(&request.remote_file),
        };
        let mut actions = vec![
            ("Overwrite", FileExistsAction::Overwrite),
            ("Overwrite if newer", FileExistsAction::OverwriteNewer),
            ("Overwrite if size differs", FileExistsAction::OverwriteSizeDiffers),
        ];
        if request.can_resume {
            actions.push(("Resume", FileExistsAction::Resume));
        }
        actions.push(("Rename", FileExistsAction::Rename));
        actions.push(("Skip", FileExistsAction::Skip));

        let names: Vec<&str> = actions.iter().map(|(name, _)| *name).collect();
        let choice = Select::with_theme(&self.theme)
            .with_prompt(format!("{target} already exists"))
            .items(&names)
            .default(0)
            .interact()?;
        let action = actions[choice].1;
        let new_name = if action == FileExistsAction::Rename {
            Some(
                Input::<String>::with_theme(&self.theme)
                    .with_prompt("New name")
                    .interact_text()?,
            )
        } else {
            None
        };
        Ok(AsyncReply::FileExists { action, new_name })
    }
}

impl Prompter for Interactive {
    fn answer(&self, request: &AsyncRequestKind) -> Result<AsyncReply> {
        match request {
            AsyncRequestKind::FileExists(request) => self.file_exists(request),
            AsyncRequestKind::HostKey(request) => self.host_key(request),
            AsyncRequestKind::Certificate(request) => self.certificate(request),
            AsyncRequestKind::InteractiveLogin(request) => {
                let response = if request.is_password_prompt {
                    Password::with_theme(&self.theme)
                        .with_prompt(&request.challenge)
                        .allow_empty_password(true)
                        .interact()?
                } else {
                    Input::<String>::with_theme(&self.theme)
                        .with_prompt(&request.challenge)
                        .allow_empty(true)
                        .interact_text()?
                };
                Ok(AsyncReply::InteractiveLogin(Some(Secret::new(response))))
            }
            AsyncRequestKind::InsecureConnection(request) => {
                let prompt = match request.reason {
                    InsecureReason::PlainFtp => format!(
                        "{} does not support TLS. Send the password in plain text?",
                        request.server
                    ),
                    InsecureReason::NoDataChannelResumption => format!(
                        "{} does not resume TLS sessions on data connections. Continue?",
                        request.server
                    ),
                };
                let allow = Confirm::with_theme(&self.theme)
                    .default(false)
                    .with_prompt(prompt)
                    .interact()?;
                Ok(AsyncReply::InsecureConnection { allow })
            }
        }
    }

    fn password(&self, prompt: &str) -> Result<Option<String>> {
        Ok(Some(
            Password::with_theme(&self.theme)
                .with_prompt(prompt)
                .interact()?,
        ))
    }
}

/// Fixed answers for unattended runs.
#[derive(Debug, Clone)]
pub struct Batch {
    pub trust_unknown: bool,
    pub allow_insecure: bool,
    pub on_exists: FileExistsAction,
}

impl Prompter for Batch {
    fn answer(&self, request: &AsyncRequestKind) -> Result<AsyncReply> {
        Ok(match request {
            AsyncRequestKind::FileExists(request) => {
                let action = match self.on_exists {
                    FileExistsAction::Resume if !request.can_resume => FileExistsAction::Overwrite,
                    FileExistsAction::Rename => FileExistsAction::Skip,
                    action => action,
                };
                AsyncReply::FileExists {
                    action,
                    new_name: None,
                }
            }
            AsyncRequestKind::HostKey(request) => {
                let trust = self.trust_unknown && !request.changed;
                if !trust {
                    warn!(
                        host = %request.host,
                        fingerprint = %request.fingerprint,
                        changed = request.changed,
                        "Rejecting host key"
                    );
                }
                AsyncReply::HostKey {
                    trust,
                    always: false,
                }
            }
            AsyncRequestKind::Certificate(request) => {
                if !self.trust_unknown {
                    warn!(host = %request.host, "Rejecting untrusted certificate");
                }
                AsyncReply::Certificate {
                    trust: self.trust_unknown,
                    always: false,
                }
            }
            AsyncRequestKind::InteractiveLogin(_) => {
                warn!("Server asked for input but nobody is attending");
                AsyncReply::InteractiveLogin(None)
            }
            AsyncRequestKind::InsecureConnection(_) => AsyncReply::InsecureConnection {
                allow: self.allow_insecure,
            },
        })
    }

    fn password(&self, _prompt: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use ferry_common::{
        FileExistsRequest, HostKeyRequest, InteractiveLoginRequest, ServerPath, TransferDirection,
    };

    use super::*;

    fn batch(trust_unknown: bool, on_exists: FileExistsAction) -> Batch {
        Batch {
            trust_unknown,
            allow_insecure: false,
            on_exists,
        }
    }

    fn host_key(changed: bool) -> AsyncRequestKind {
        AsyncRequestKind::HostKey(HostKeyRequest {
            host: "files.example.com".into(),
            port: 22,
            fingerprint: "SHA256:abc".into(),
            changed,
        })
    }

    fn file_exists(can_resume: bool) -> AsyncRequestKind {
        AsyncRequestKind::FileExists(FileExistsRequest {
            direction: TransferDirection::Download,
            local: "/tmp/a.txt".into(),
            local_size: Some(3),
            local_time: None,
            remote_path: ServerPath::root(),
            remote_file: "a.txt".into(),
            remote_size: Some(10),
            remote_time: None,
            can_resume,
        })
    }

    #[test]
    fn changed_host_keys_are_never_trusted_unattended() {
        let prompter = batch(true, FileExistsAction::Skip);
        assert!(matches!(
            prompter.answer(&host_key(false)).unwrap(),
            AsyncReply::HostKey { trust: true, always: false }
        ));
        assert!(matches!(
            prompter.answer(&host_key(true)).unwrap(),
            AsyncReply::HostKey { trust: false, .. }
        ));
        assert!(matches!(
            batch(false, FileExistsAction::Skip)
                .answer(&host_key(false))
                .unwrap(),
            AsyncReply::HostKey { trust: false, .. }
        ));
    }

    #[test]
    fn resume_falls_back_to_overwrite() {
        let prompter = batch(false, FileExistsAction::Resume);
        assert!(matches!(
            prompter.answer(&file_exists(false)).unwrap(),
            AsyncReply::FileExists {
                action: FileExistsAction::Overwrite,
                ..
            }
        ));
        assert!(matches!(
            prompter.answer(&file_exists(true)).unwrap(),
            AsyncReply::FileExists {
                action: FileExistsAction::Resume,
                ..
            }
        ));
    }

    #[test]
    fn login_prompts_are_cancelled() {
        let prompter = batch(true, FileExistsAction::Skip);
        let request = AsyncRequestKind::InteractiveLogin(InteractiveLoginRequest {
            challenge: "Verification code:".into(),
            is_password_prompt: false,
        });
        assert!(matches!(
            prompter.answer(&request).unwrap(),
            AsyncReply::InteractiveLogin(None)
        ));
        assert_eq!(prompter.password("Password").unwrap(), None);
    }
}
