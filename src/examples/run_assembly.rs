use awareness_operator::{
    Assembly, Item, Operation, OperatorConfig, ProgressHook, Stream, TcpConnector,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Runs an assembly against operators started with `serve_operator`.
///
/// Usage: run_assembly [assembly.json] [config.json]
fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,awareness_operator=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let assembly = match args.next() {
        Some(path) => Assembly::from_json_str(&std::fs::read_to_string(path)?)?,
        None => default_assembly(),
    };
    let config = match args.next() {
        Some(path) => OperatorConfig::load(path)?,
        None => OperatorConfig::default(),
    };

    let mut stream = Stream::new(vec![
        Item::new(vec![10.0, 20.0, 30.0]),
        Item::new(vec![4.0, 8.0, 15.0]),
        Item::new(vec![200.0, 100.0, 0.0]),
    ]);

    let mut hook = ProgressHook::new(1, |progress| {
        tracing::info!(
            completed = progress.completed,
            total = progress.total,
            "progress"
        );
    });
    assembly.run(
        &TcpConnector::new(config.net.clone())?,
        &mut stream,
        config.assembly.offset_convention,
        Some(&mut hook),
    )?;

    for (row, item) in stream.items.iter().enumerate() {
        println!("row {row}: {:?}", item.parameters);
    }

    Ok(())
}

/// Mean of the three inputs into slot 3, then the spread between slot 2 and the mean
fn default_assembly() -> Assembly {
    let operation = |affinity_index, input_offset, output_offset| Operation {
        address: "127.0.0.1".into(),
        port: 1600,
        affinity_index,
        input_offset,
        output_offset,
    };
    Assembly::new(vec![operation(0, 0, 3), operation(1, 2, 4)])
}
