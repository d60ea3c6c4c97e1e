fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "../proto/jumpstarter/v1/controller.proto",
                "../proto/jumpstarter/v1/router.proto",
                "../proto/jumpstarter/client/v1/client.proto",
            ],
            &["../proto"],
        )?;
    Ok(())
}
