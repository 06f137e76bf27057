use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

const PROTO_ROOT_ENV: &str = "GITALY_PROTO_ROOT";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed={PROTO_ROOT_ENV}");
    println!("cargo:rerun-if-env-changed=PROTOC");

    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let proto_root = resolve_proto_root(&crate_dir)?;
    println!("cargo:rerun-if-changed={}", proto_root.display());

    if env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        env::set_var("PROTOC", protoc);
    }

    let mut protos = std::fs::read_dir(&proto_root)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension() == Some(OsStr::new("proto")))
        .collect::<Vec<_>>();
    protos.sort();

    if protos.is_empty() {
        return Err(format!("no proto files found in {}", proto_root.display()).into());
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&protos, &[proto_root])?;

    Ok(())
}

fn resolve_proto_root(crate_dir: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let mut candidates = Vec::new();
    if let Some(configured_root) = env::var_os(PROTO_ROOT_ENV) {
        candidates.push(PathBuf::from(configured_root));
    }
    candidates.push(crate_dir.join("../..").join("proto"));

    for candidate in &candidates {
        if candidate.is_dir() {
            return Ok(candidate.canonicalize().unwrap_or_else(|_| candidate.clone()));
        }
    }

    let searched = candidates
        .iter()
        .map(|candidate| candidate.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(format!(
        "Unable to locate proto root. Searched paths: {searched}. Set `{PROTO_ROOT_ENV}` to a valid `proto` directory."
    )
    .into())
}
