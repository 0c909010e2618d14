#[macro_export]
macro_rules! fixture {
    ($file:expr) => {
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/test/resources/",
            $file
        ))
    };
}

#[macro_export]
macro_rules! bytes_fixture {
    ($file:expr) => {
        include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/test/resources/",
            $file
        ))
    };
}

#[macro_export]
macro_rules! code_fixture {
    ($file:expr) => {
        include!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/test/resources/",
            $file
        ))
    };
}

#[macro_export]
macro_rules! fixture_path {
    ($file:expr) => {
        std::path::Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/test/resources/",
            $file
        ))
    }
}
