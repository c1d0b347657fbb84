use crate::docker::runtime::container_runtime_path;

pub fn print_startup_banner(image: &str) {
    let version = env!("CARGO_PKG_VERSION");
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let docker_disp = container_runtime_path()
        .ok()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not found)".to_string());

    eprintln!();
    eprintln!("────────────────────────────────────────────────────────────");
    eprintln!("  adz-runner v{version}  -  containerized CLI agent sessions");
    eprintln!("────────────────────────────────────────────────────────────");
    eprintln!("    - Engines: codex | gemini | opencode");
    eprintln!("    - Runtime: {docker_disp}");
    eprintln!("    - Image:   {image}");
    eprintln!("    - Platform: {os}/{arch}");
    eprintln!("    - Disposable containers; only the workspace and the");
    eprintln!("      credentials pocket persist across sessions.");
    eprintln!("────────────────────────────────────────────────────────────");
    eprintln!();
}
