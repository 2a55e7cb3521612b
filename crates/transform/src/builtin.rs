//! Release manifests compiled into the binary; mirrors `releases/`.

macro_rules! release {
    ($kind:literal, $version:literal) => {
        (
            $kind,
            $version,
            include_str!(concat!("../releases/", $kind, "/", $version, "/manifests.yaml")),
            include_str!(concat!("../releases/", $kind, "/", $version, "/images.yaml")),
        )
    };
}

/// `(kind, version, manifests, images)`
pub(crate) const RELEASES: &[(&str, &str, &str, &str)] = &[
    release!("pipeline", "v0.9.0"),
    release!("pipeline", "v0.10.0"),
    release!("triggers", "v0.25.0"),
    release!("triggers", "v0.26.0"),
    release!("dashboard", "v0.40.0"),
    release!("results", "v0.9.0"),
    release!("chains", "v0.20.0"),
];
