const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const PKG_REPOSITORY: Option<&str> = option_env!("CARGO_PKG_REPOSITORY");
const PKG_LICENSE: Option<&str> = option_env!("CARGO_PKG_LICENSE");
const BUILD_TARGET: Option<&str> = option_env!("STACKRUN_BUILD_TARGET");
const BUILD_PROFILE: Option<&str> = option_env!("STACKRUN_BUILD_PROFILE");
const BUILD_TIMESTAMP: Option<&str> = option_env!("STACKRUN_BUILD_TIMESTAMP");
const GIT_SHA: Option<&str> = option_env!("STACKRUN_GIT_SHA");
const GIT_DIRTY: Option<&str> = option_env!("STACKRUN_GIT_DIRTY");

pub fn short() -> String {
    format!("{PKG_NAME} {PKG_VERSION}")
}

pub fn describe() -> String {
    let mut lines = vec![short(), PKG_DESCRIPTION.to_string()];

    if let Some(repo) = PKG_REPOSITORY {
        lines.push(format!("repository: {repo}"));
    }
    if let Some(license) = PKG_LICENSE {
        lines.push(format!("license: {license}"));
    }

    lines.push(format!(
        "commit: {} (dirty: {})",
        GIT_SHA.unwrap_or("unknown"),
        GIT_DIRTY.unwrap_or("unknown"),
    ));
    lines.push(format!(
        "built: {} [{} for {}]",
        BUILD_TIMESTAMP.unwrap_or("unknown time"),
        BUILD_PROFILE.unwrap_or("unknown profile"),
        BUILD_TARGET.unwrap_or("unknown target"),
    ));
    lines.join("\n")
}
