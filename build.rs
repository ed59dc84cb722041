fn main() {
    // CoreBluetooth refuses to scan from a binary without an Info.plist that
    // declares NSBluetoothAlwaysUsageDescription.  CLI tools have no bundle,
    // so the plist is linked into the __TEXT,__info_plist section instead.
    // CARGO_CFG_TARGET_OS is the target, so this also covers cross builds.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        return;
    };
    for arg in ["-sectcreate", "__TEXT", "__info_plist"] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rustc-link-arg-bins={dir}/Info.plist");
    println!("cargo:rerun-if-changed=Info.plist");
}
