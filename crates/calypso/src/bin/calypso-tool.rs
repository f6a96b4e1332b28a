//! Command-line tool running a Calypso secure session
//!
//! With the `stub` plugin the tool provisions an emulated card and SAM so the
//! full flow runs without hardware. With the `pcsc` plugin (cargo feature
//! `pcsc`) it talks to real readers.

use calypso_reader::stub::{StubPluginFactory, StubReaderConfig};
use calypso_reader::{
    PluginFactory, ReaderProtocol, STUB_PLUGIN_NAME, SmartCardContext, plugin_factory,
};
use calypso_transaction::emulator::{KeySet, VirtualCalypsoCard, VirtualSam};
use calypso_transaction::{
    CardResource, CardSelectionsService, CardSelector, CardTransaction, PoSelection, SamRevision,
    SecurityContext, SessionAccessLevel, SmartCard,
};
use clap::{Parser, Subcommand};

/// Sample environment record stored in the emulated card
const SAMPLE_RECORD: [u8; 16] = [
    0x24, 0xB9, 0x28, 0x48, 0x08, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Reader plugin ("stub" or "pcsc")
    #[arg(long, default_value = STUB_PLUGIN_NAME)]
    plugin: String,

    /// Reader holding the card
    #[arg(long, default_value = "stub1")]
    po_reader: String,

    /// Reader holding the SAM
    #[arg(long, default_value = "sam1")]
    sam_reader: String,

    /// Reader protocol activated on the card reader
    #[arg(long, default_value = "ISO_7816_3_T1")]
    protocol: String,

    /// SAM revision (AUTO, C1, S1D or S1E)
    #[arg(long, default_value = "AUTO")]
    sam_revision: String,

    /// AID of the application to select (hex)
    #[arg(long, default_value = "A000000291")]
    aid: String,

    /// SFI of the record read in the session
    #[arg(long, default_value_t = 0x07)]
    sfi: u8,

    /// Number of the record read in the session
    #[arg(long, default_value_t = 1)]
    record: u8,

    /// Session access level (PERSO, LOAD or DEBIT)
    #[arg(long, default_value = "DEBIT")]
    access_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the readers of the plugin
    ListReaders,

    /// Select the card, read a record in a secure session and close it
    Run,
}

/// Stub plugin with an emulated card and SAM matching the command line
fn stub_factory(cli: &Cli) -> Result<StubPluginFactory, Box<dyn std::error::Error>> {
    let protocol: ReaderProtocol = cli.protocol.parse()?;
    let revision: SamRevision = cli.sam_revision.parse()?;
    let mut df_name = hex::decode(&cli.aid)?;
    df_name.extend_from_slice(&[0x01, 0x01]);

    let mut factory = StubPluginFactory::new(STUB_PLUGIN_NAME);
    factory
        .plug_reader(&cli.po_reader, StubReaderConfig::default())
        .insert_card(
            VirtualCalypsoCard::builder()
                .protocol(protocol)
                .df_name(&df_name)
                .record(cli.sfi, cli.record, &SAMPLE_RECORD)
                .build(),
        );
    factory
        .plug_reader(&cli.sam_reader, StubReaderConfig::default())
        .insert_card(VirtualSam::new(revision, [0x00, 0x00, 0x00, 0x01], KeySet::test_keys()));
    Ok(factory)
}

fn run(context: &SmartCardContext, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let revision: SamRevision = cli.sam_revision.parse()?;
    let level: SessionAccessLevel = cli.access_level.parse()?;

    let po_reader = context.reader(&cli.po_reader)?;
    po_reader
        .lock()
        .activate_protocol(&cli.protocol, &cli.protocol)?;

    println!("Establishing security context on {}...", cli.sam_reader);
    let security = SecurityContext::establish(&context.reader(&cli.sam_reader)?, revision, None)?;
    println!(
        "SAM {} serial {}",
        security.sam().card().revision(),
        hex::encode_upper(security.sam().card().serial_number())
    );

    println!("Selecting {} on {}...", cli.aid, cli.po_reader);
    let selector = CardSelector::builder()
        .aid(&cli.aid)
        .card_protocol(cli.protocol.as_str())
        .build()?;
    let mut selections = CardSelectionsService::new();
    selections.prepare_selection(PoSelection::new(selector)?);
    let selected = selections.process_explicit_selections(&po_reader)?;

    let mut transaction = CardTransaction::new(CardResource::new(po_reader, selected.card))
        .with_security_context(security);
    transaction
        .prepare_read_record(cli.sfi, cli.record)?
        .prepare_release_channel();
    transaction.open_session(level)?;
    transaction.close_session()?;

    println!(
        "Session closed with {}",
        hex::encode_upper(transaction.active_card_identity())
    );
    match transaction.card().file_data().record(cli.sfi, cli.record) {
        Some(data) => println!(
            "Record {} of SFI {:#04x}: {}",
            cli.record,
            cli.sfi,
            hex::encode_upper(data)
        ),
        None => println!("Record {} of SFI {:#04x} is empty", cli.record, cli.sfi),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the tracing logger with env_format and ansi
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();

    let cli = Cli::parse();

    let factory: Box<dyn PluginFactory> = if cli.plugin == STUB_PLUGIN_NAME {
        Box::new(stub_factory(&cli)?)
    } else {
        plugin_factory(&cli.plugin)?
    };
    let mut context = SmartCardContext::new();
    context.register_plugin(factory.as_ref())?;

    let result = match cli.command {
        Commands::ListReaders => {
            let names = context.reader_names();
            if names.is_empty() {
                println!("No readers found.");
            } else {
                println!("Available readers:");
                for (i, name) in names.iter().enumerate() {
                    let status = if context.reader(name)?.lock().is_card_present()? {
                        "card present"
                    } else {
                        "no card"
                    };
                    println!("{}. {} ({})", i + 1, name, status);
                }
            }
            Ok(())
        }
        Commands::Run => run(&context, &cli),
    };

    context.shutdown();
    result
}
