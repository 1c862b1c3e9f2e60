use std::process::Command;

fn main() {
    let rustc_version = Command::new("rustc")
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=RUSTC_VERSION={}", rustc_version.trim());

    let build_number = std::env::var("BUILD_NUMBER").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=BUILD_NUMBER={}", build_number);

    let build_date = std::env::var("BUILD_DATE").unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=BUILD_DATE={}", build_date);

    println!("cargo:rerun-if-env-changed=BUILD_NUMBER");
    println!("cargo:rerun-if-env-changed=BUILD_DATE");
}
