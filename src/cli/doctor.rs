use crate::config::get_config_path;
use crate::errors::ProxyError;
use crate::store::{DB_FILE, Store};
use crate::upstream::isolation::uses_isolation;
use crate::utils::data_dir;
use std::path::PathBuf;

struct Check {
    name: &'static str,
    outcome: Outcome,
}

enum Outcome {
    Pass(String),
    Warn(String),
    Fail(String),
}

/// Run local diagnostics: config, data dir, database, keyring, docker.
pub async fn run(config_path: Option<&PathBuf>) -> Result<(), ProxyError> {
    let mut checks = Vec::new();

    let path = match config_path {
        Some(path) => path.clone(),
        None => get_config_path().map_err(ProxyError::Internal)?,
    };

    let config = match crate::config::load_config(Some(&path)) {
        Ok(config) => {
            let issues = config.validate_detailed();
            if issues.is_empty() {
                checks.push(Check {
                    name: "config",
                    outcome: Outcome::Pass(format!("{} valid", path.display())),
                });
            } else {
                let summary = issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                checks.push(Check {
                    name: "config",
                    outcome: Outcome::Warn(summary),
                });
            }
            Some(config)
        }
        Err(e) => {
            checks.push(Check {
                name: "config",
                outcome: Outcome::Fail(format!("{:#}", e)),
            });
            None
        }
    };

    match data_dir() {
        Ok(dir) => {
            let probe = dir.join(".doctor_probe");
            match std::fs::create_dir_all(&dir)
                .and_then(|()| std::fs::write(&probe, b"ok"))
                .and_then(|()| std::fs::remove_file(&probe))
            {
                Ok(()) => checks.push(Check {
                    name: "data dir",
                    outcome: Outcome::Pass(format!("{} writable", dir.display())),
                }),
                Err(e) => checks.push(Check {
                    name: "data dir",
                    outcome: Outcome::Fail(format!("{}: {}", dir.display(), e)),
                }),
            }

            match Store::open(dir.join(DB_FILE)) {
                Ok(store) => {
                    match store.stats() {
                        Ok(stats) => {
                            let total: u64 = stats.buckets.values().sum();
                            checks.push(Check {
                                name: "database",
                                outcome: Outcome::Pass(format!("{} entries", total)),
                            });
                        }
                        Err(e) => checks.push(Check {
                            name: "database",
                            outcome: Outcome::Fail(e.to_string()),
                        }),
                    }
                    store.close();
                }
                Err(e) => checks.push(Check {
                    name: "database",
                    outcome: Outcome::Fail(e.to_string()),
                }),
            }
        }
        Err(e) => checks.push(Check {
            name: "data dir",
            outcome: Outcome::Fail(format!("{:#}", e)),
        }),
    }

    checks.push(keyring_check());

    if let Some(config) = &config {
        if uses_isolation(&config.mcp_servers) {
            match which::which("docker") {
                Ok(path) => checks.push(Check {
                    name: "docker",
                    outcome: Outcome::Pass(path.display().to_string()),
                }),
                Err(_) => checks.push(Check {
                    name: "docker",
                    outcome: Outcome::Fail(
                        "isolation is enabled but no docker binary was found".to_string(),
                    ),
                }),
            }
        }
    }

    let mut failed = false;
    for check in &checks {
        match &check.outcome {
            Outcome::Pass(detail) => println!("PASS  {:<10} {}", check.name, detail),
            Outcome::Warn(detail) => println!("WARN  {:<10} {}", check.name, detail),
            Outcome::Fail(detail) => {
                failed = true;
                println!("FAIL  {:<10} {}", check.name, detail);
            }
        }
    }

    if failed {
        Err(ProxyError::Fatal("diagnostics reported failures".into()))
    } else {
        Ok(())
    }
}

#[cfg(feature = "keyring-store")]
fn keyring_check() -> Check {
    match keyring::Entry::new("mcpproxy", "_doctor_probe") {
        Ok(entry) => {
            // get_password on a missing entry proves the backend responds
            match entry.get_password() {
                Ok(_) | Err(keyring::Error::NoEntry) => Check {
                    name: "keyring",
                    outcome: Outcome::Pass("backend available".to_string()),
                },
                Err(e) => Check {
                    name: "keyring",
                    outcome: Outcome::Warn(format!("backend errored: {}", e)),
                },
            }
        }
        Err(e) => Check {
            name: "keyring",
            outcome: Outcome::Warn(format!("unavailable: {}", e)),
        },
    }
}

#[cfg(not(feature = "keyring-store"))]
fn keyring_check() -> Check {
    Check {
        name: "keyring",
        outcome: Outcome::Warn("compiled without keyring-store".to_string()),
    }
}
