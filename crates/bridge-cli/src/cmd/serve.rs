use bridge_core::settings::Settings;

pub fn run(settings: Settings, port: u16, api_key: String, retry_loop: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(bridge_server::serve(settings, port, api_key, retry_loop))
}
