use std::{
    path::{Path, PathBuf},
    process::Command,
};

#[derive(thiserror::Error, Debug)]
pub enum DesktopError {

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} exited with {status}")]
    Command { program: &'static str, status: std::process::ExitStatus },

    #[error("not supported on this platform")]
    Unsupported,

}

type Result<T> = std::result::Result<T, DesktopError>;

// Hooks into the user's desktop: file manager and folder picker.
pub trait Desktop: Send + Sync {

    fn open_folder(&self, path: &Path) -> Result<()>;

    // None when the user cancelled.
    fn pick_directory(&self) -> Result<Option<PathBuf>>;
}

// Shells out to the platform's own tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDesktop;

impl Desktop for SystemDesktop {

    fn open_folder(&self, path: &Path) -> Result<()> {
        let program = file_manager()?;
        tracing::debug!("opening {} with {}", path.display(), program);
        let status = Command::new(program).arg(path).status()?;
        // explorer reports failure even when the window opened.
        if !status.success() && program != "explorer" {
            return Err(DesktopError::Command { program, status });
        }
        Ok(())
    }

    fn pick_directory(&self) -> Result<Option<PathBuf>> {
        let (program, args) = folder_picker()?;
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            // Cancelling the dialog exits non-zero.
            return Ok(None);
        }
        let picked = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!picked.is_empty()).then(|| PathBuf::from(picked)))
    }
}

#[cfg(target_os = "linux")]
fn file_manager() -> Result<&'static str> { Ok("xdg-open") }

#[cfg(target_os = "macos")]
fn file_manager() -> Result<&'static str> { Ok("open") }

#[cfg(target_os = "windows")]
fn file_manager() -> Result<&'static str> { Ok("explorer") }

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn file_manager() -> Result<&'static str> { Err(DesktopError::Unsupported) }

#[cfg(target_os = "linux")]
fn folder_picker() -> Result<(&'static str, &'static [&'static str])> {
    Ok(("zenity", &["--file-selection", "--directory", "--title=Select folder to seed"]))
}

#[cfg(target_os = "macos")]
fn folder_picker() -> Result<(&'static str, &'static [&'static str])> {
    Ok((
        "osascript",
        &["-e", "POSIX path of (choose folder with prompt \"Select folder to seed\")"],
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn folder_picker() -> Result<(&'static str, &'static [&'static str])> {
    Err(DesktopError::Unsupported)
}
