use std::fs;

fn main() {
    // reqwest version extraction, used in the User-Agent we present to CAs and webhook receivers
    let reqwest_version = fs::read_to_string("Cargo.lock")
        .ok()
        .and_then(|cargo_lock| toml::from_str::<toml::Value>(&cargo_lock).ok())
        .and_then(|lockfile| {
            lockfile
                .get("package")?
                .as_array()?
                .iter()
                .find(|pkg| pkg.get("name").and_then(toml::Value::as_str) == Some("reqwest"))
                .and_then(|pkg| pkg.get("version")?.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=REQWEST_VERSION={reqwest_version}");
    println!("cargo:rerun-if-changed=Cargo.lock");
    println!("cargo:rerun-if-changed=db/migrations");
}
