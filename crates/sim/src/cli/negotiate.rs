use fm_domain::config::Config;
use fm_protocol::ProtocolCatalog;

/// Resolve the responder for `protocol` offered at `versions` and print it.
pub fn run(config: &Config, protocol: &str, versions: &[u32]) -> anyhow::Result<()> {
    let catalog = ProtocolCatalog::from_config(&config.protocols)?;
    let matched = catalog.responder_for_protocol(protocol, versions)?;
    println!("{} v{} -> {}", matched.protocol, matched.version, matched.flow);
    Ok(())
}
