use std::process::Command;

/// Stdout of a git command, if it ran and printed something
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let commit = match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) if git(&["status", "--porcelain", "--untracked-files=no"]).is_some() => {
            format!("{}-dirty", hash)
        }
        Some(hash) => hash,
        None => "unknown".to_string(),
    };

    // SOURCE_DATE_EPOCH keeps packaged builds reproducible
    let built = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|epoch| epoch.parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(chrono::Utc::now);

    println!("cargo:rustc-env=H2TUNNEL_COMMIT={}", commit);
    println!(
        "cargo:rustc-env=H2TUNNEL_BUILD_DATE={}",
        built.format("%Y-%m-%d")
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
}
