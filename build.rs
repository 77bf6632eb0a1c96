fn main() {
    // Only the device target links against ESP-IDF; host builds (unit tests)
    // must not require the espidf toolchain environment.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
