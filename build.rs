use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // Create config template if it doesn't exist
    let out_dir = env::var("OUT_DIR").unwrap_or_else(|_| "./".to_string());
    let template_path = Path::new(&out_dir).join("../../../pvrlink.conf.template");

    let template = r#"# pvrlink configuration template
# Copy this file to 'pvrlink.conf' and fill in your actual values

listen_port = 34891
stream_timeout_sec = 3
timeshift_dir = /video
timeshift_max_bytes = 1073741824
cache_dir = /video
# preferred audio language and codec
language = eng
audio_type = AC3
"#;

    let _ = fs::write(template_path, template);
    println!("cargo:rerun-if-changed=build.rs");
}
