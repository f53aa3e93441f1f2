//! Locate command implementation.

use rsession_core::EngineRuntime;
use rsession_core::locate::locate_worker_binary;

use crate::colors;

pub fn execute(runtime: &EngineRuntime) -> anyhow::Result<()> {
    let installation = runtime.resolve_installation()?;
    let settings = runtime.settings();

    println!("{}R installation{}", colors::BOLD, colors::RESET);
    println!("  home:       {}", installation.home.display());
    println!("  executable: {}", installation.executable.display());
    println!("  Rscript:    {}", installation.script_executable.display());

    println!("\n{}Workers{}", colors::BOLD, colors::RESET);
    match locate_worker_binary(settings) {
        Ok(path) => println!("  binary:     {}", path.display()),
        Err(e) => println!(
            "  binary:     {}not found{} ({})",
            colors::YELLOW,
            colors::RESET,
            e
        ),
    }
    println!("  topology:   {:?}", settings.topology());
    println!(
        "  ports:      {}:{}..{}",
        settings.host,
        settings.base_port,
        u32::from(settings.base_port) + u32::from(settings.port_window)
    );
    println!("  work dir:   {}", settings.work_dir().display());

    Ok(())
}
