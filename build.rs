use std::env;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=GIT_DIR");
    println!("cargo:rerun-if-changed=.git/HEAD");

    match git(&["rev-parse", "--short", "HEAD"]) {
        Ok(sha) => println!("cargo:rustc-env=STACKRUN_GIT_SHA={sha}"),
        Err(err) => eprintln!("warning: {err}"),
    }

    let dirty = match git(&["status", "--porcelain"]) {
        Ok(output) if output.trim().is_empty() => "clean",
        Ok(_) => "dirty",
        Err(_) => "unknown",
    };
    println!("cargo:rustc-env=STACKRUN_GIT_DIRTY={dirty}");

    println!(
        "cargo:rustc-env=STACKRUN_BUILD_TIMESTAMP={}",
        Utc::now().to_rfc3339()
    );
    println!(
        "cargo:rustc-env=STACKRUN_BUILD_TARGET={}",
        env::var("TARGET").unwrap_or_else(|_| "unknown".into())
    );
    println!(
        "cargo:rustc-env=STACKRUN_BUILD_PROFILE={}",
        env::var("PROFILE").unwrap_or_else(|_| "unknown".into())
    );
}

fn git(args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .output()
        .map_err(|err| err.to_string())?;
    if !output.status.success() {
        return Err(format!(
            "git {:?} failed with status {:?}",
            args,
            output.status.code()
        ));
    }
    let text = String::from_utf8(output.stdout).map_err(|err| err.to_string())?;
    Ok(text.trim().to_string())
}
