use std::process::Command;

// best effort, builds from a source tarball have no git metadata
fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .current_dir("..")
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

fn main() {
    if let Some(describe) = git_output(&["describe", "--tags", "--long", "--always", "--dirty"]) {
        println!("cargo:rustc-env=BCAST_GIT_DESCRIBE={describe}");
    }
    if let Some(hash) = git_output(&["rev-parse", "HEAD"]) {
        println!("cargo:rustc-env=BCAST_GIT_HASH={hash}");
    }
    let git_dir = std::path::Path::new("..").join(".git");
    if git_dir.exists() {
        println!("cargo:rerun-if-changed=../.git/HEAD");
        println!("cargo:rerun-if-changed=../.git/refs");
    }
}
