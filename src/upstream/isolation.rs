use crate::config::ServerSpec;
use std::collections::HashMap;

const DEFAULT_IMAGE: &str = "mcpproxy/runtime:latest";

/// Command line for launching one stdio upstream, after isolation rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
}

/// Build the launch plan for a stdio server. With isolation enabled the
/// original command is rewritten to run inside `docker run -i`; environment
/// variables travel as `-e` pairs so nothing from the host leaks past the
/// filter. Image selection policy lives outside the core: only the
/// configured image (or a neutral default) is honored here.
pub fn launch_plan(spec: &ServerSpec, env: HashMap<String, String>) -> LaunchPlan {
    let command = spec.command.clone().unwrap_or_default();
    let isolation = spec.isolation.as_ref().filter(|iso| iso.enabled);

    let Some(iso) = isolation else {
        return LaunchPlan {
            program: command,
            args: spec.args.clone(),
            env,
            working_dir: spec.working_dir.clone(),
        };
    };

    let mut args = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];
    if let Some(mode) = &iso.network_mode {
        args.push(format!("--network={}", mode));
    }
    if let Some(driver) = &iso.log_driver {
        args.push(format!("--log-driver={}", driver));
    }
    if let Some(dir) = iso.working_dir.as_ref().or(spec.working_dir.as_ref()) {
        args.push("-w".to_string());
        args.push(dir.clone());
    }
    let mut names: Vec<_> = env.keys().cloned().collect();
    names.sort();
    for name in names {
        args.push("-e".to_string());
        args.push(format!("{}={}", name, env[&name]));
    }
    args.extend(iso.extra_args.iter().cloned());
    args.push(
        iso.image
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
    );
    args.push(command);
    args.extend(spec.args.iter().cloned());

    LaunchPlan {
        program: "docker".to_string(),
        args,
        // env is carried via -e flags; the docker client itself gets nothing
        env: HashMap::new(),
        working_dir: None,
    }
}

/// Whether any configured server needs the docker CLI at runtime.
pub fn uses_isolation(specs: &[ServerSpec]) -> bool {
    specs
        .iter()
        .any(|s| s.isolation.as_ref().is_some_and(|iso| iso.enabled))
}
