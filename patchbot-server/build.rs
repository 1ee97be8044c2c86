fn main() {
    built::write_built_file().expect("Failed to acquire build-time information");

    // Deployment pipelines can pin the reported revision explicitly
    println!("cargo:rerun-if-env-changed=PATCHBOT_GIT_HASH");
    if let Ok(hash) = std::env::var("PATCHBOT_GIT_HASH") {
        println!("cargo:rustc-env=PATCHBOT_GIT_HASH={}", hash);
    }
}
