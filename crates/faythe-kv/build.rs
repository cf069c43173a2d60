fn main() {
    // etcd-client's build script needs a `protoc` binary on the system to
    // compile its bundled .proto files. There is no system protoc available
    // in this environment, so vendor one via protoc-bin-vendored and point
    // PROTOC at it for the whole workspace build (see .cargo/config.toml).
    let _ = protoc_bin_vendored::protoc_bin_path();
}
