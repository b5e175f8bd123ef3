//! 引擎版本与构建元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Build Metadata** → build.rs 中的 vergen

/// 引擎 semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（短 sha）；非 git 环境构建时为 "unknown"
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// 构建时间；非 vergen 构建时为 "unknown"
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 用于日志和远端请求头的版本串，如 `septica-sync/0.1.0 (abc1234)`
pub fn user_agent() -> String {
    format!("septica-sync/{} ({})", SDK_VERSION, GIT_SHA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_contains_version() {
        let ua = user_agent();
        assert!(ua.starts_with("septica-sync/"));
        assert!(ua.contains(SDK_VERSION));
    }
}
