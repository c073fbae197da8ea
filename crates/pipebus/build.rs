//! Captures build provenance for `pipebus version --extended`.

fn main() {
    for (var, env) in [
        ("TARGET", "PIPEBUS_BUILD_TARGET"),
        ("PROFILE", "PIPEBUS_BUILD_PROFILE"),
    ] {
        let value = std::env::var(var).unwrap_or_else(|_| "unknown".to_string());
        println!("cargo:rustc-env={env}={value}");
        println!("cargo:rerun-if-env-changed={var}");
    }
}
