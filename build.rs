fn main() {
    // The dashboard UI itself is an external collaborator (see spec scope);
    // this crate only embeds whatever static assets land under `static/`
    // via `rust_embed`. Nothing to build here.
    println!("cargo:rerun-if-changed=static");
}
