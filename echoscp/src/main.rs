use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dicom_dictionary_std::uids;
use dicom_dimse::association::AcceptorPolicy;
use dicom_dimse::message::{DicomRequest, DicomResponse, Status};
use dicom_dimse::provider::{Capabilities, CStoreProvider, ServiceProvider};
use dicom_dimse::server::DicomServer;
use dicom_dimse::service::{DicomServiceBuilder, ServiceOptions};
use dicom_dimse::storage::{self, StoreMeta, TempFileStorage};
use dicom_object::FileMetaTableBuilder;
use snafu::{OptionExt, Report, ResultExt, Whatever};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// DICOM C-ECHO SCP
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// Verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// Application Entity title of this node
    #[arg(long = "ae-title", default_value = "ECHO-SCP")]
    ae_title: String,
    /// Which port to listen on
    #[arg(short, long, default_value = "11112")]
    port: u16,
    /// Enforce max pdu length
    #[arg(short = 's', long = "strict")]
    strict: bool,
    /// Accept unknown SOP classes
    #[arg(long)]
    promiscuous: bool,
    /// Accept associations regardless of the called AE title
    #[arg(long)]
    accept_any_called_ae_title: bool,
    /// Maximum PDU length
    #[arg(
        short = 'm',
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131072))
    )]
    max_pdu_length: u32,
    /// Maximum number of outstanding operations per association
    /// (0 for unlimited)
    #[arg(long = "max-async-ops", default_value = "1")]
    max_async_ops: u16,
    /// Abort associations idle for this many seconds
    #[arg(long = "read-timeout", value_name = "SECONDS")]
    read_timeout: Option<u64>,
    /// Also accept C-STORE requests
    #[arg(long)]
    store: bool,
    /// Output directory for incoming objects
    #[arg(short = 'o', default_value = ".")]
    out_dir: PathBuf,
}

/// Writes every received instance to a DICOM file in a directory.
struct StoreToDirectory {
    out_dir: PathBuf,
}

impl StoreToDirectory {
    fn write_file(&self, request: &mut DicomRequest) -> Result<PathBuf, Whatever> {
        let instance = request
            .take_received_instance()
            .whatever_context("no instance was received")?;
        let meta = instance.meta().clone();
        let file_meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(meta.sop_class_uid.as_str())
            .media_storage_sop_instance_uid(meta.sop_instance_uid.as_str())
            .transfer_syntax(meta.transfer_syntax.as_str())
            .build()
            .whatever_context("failed to build DICOM meta file information")?;
        let file_obj = instance.into_dataset().into_object().with_exact_meta(file_meta);

        let mut file_path = self.out_dir.clone();
        file_path.push(meta.sop_instance_uid.trim_end_matches('\0').to_string() + ".dcm");
        file_obj
            .write_to_file(&file_path)
            .whatever_context("could not save DICOM object to file")?;
        Ok(file_path)
    }
}

impl CStoreProvider for StoreToDirectory {
    fn on_c_store_request(&self, request: &mut DicomRequest) -> DicomResponse {
        match self.write_file(request) {
            Ok(path) => {
                info!("Stored {}", path.display());
                DicomResponse::new(request, Status::SUCCESS)
            }
            Err(e) => {
                error!("{}", Report::from_error(&e));
                DicomResponse::new(request, Status::OUT_OF_RESOURCES)
                    .with_error_comment(e.to_string())
            }
        }
    }

    fn on_c_store_request_exception(&self, meta: &StoreMeta, error: &storage::Error) {
        warn!(
            "Discarding instance {}: {}",
            meta.sop_instance_uid,
            Report::from_error(error)
        );
    }
}

fn main() {
    let app = App::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .with_env_filter(EnvFilter::from_default_env().add_directive(if app.verbose {
                Level::DEBUG.into()
            } else {
                Level::INFO.into()
            }))
            .finish(),
    )
    .whatever_context("Could not set up global logging subscriber")
    .unwrap_or_else(|e: Whatever| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            error!("Could not start runtime: {}", e);
            std::process::exit(-2);
        });
    runtime.block_on(async move {
        run(app).await.unwrap_or_else(|e| {
            error!("{}", Report::from_error(e));
            std::process::exit(-2);
        });
    });
}

async fn run(args: App) -> Result<(), Whatever> {
    let App {
        verbose,
        ae_title,
        port,
        strict,
        promiscuous,
        accept_any_called_ae_title,
        max_pdu_length,
        max_async_ops,
        read_timeout,
        store,
        out_dir,
    } = args;

    let mut options = ServiceOptions::new()
        .max_pdu_length(max_pdu_length)
        .strict(strict)
        .max_async_ops_invoked(max_async_ops)
        .use_remote_ae_for_log_name(true)
        .log_dimse_datasets(verbose);
    if let Some(seconds) = read_timeout {
        options = options.read_timeout(Duration::from_secs(seconds));
    }

    let mut policy = AcceptorPolicy::new()
        .ae_title(&ae_title)
        .promiscuous(promiscuous)
        .with_abstract_syntax(uids::VERIFICATION);
    let mut capabilities = Capabilities::verification();
    let mut builder = DicomServiceBuilder::new();

    if store {
        std::fs::create_dir_all(&out_dir).whatever_context("Could not create output directory")?;
        for sop_class in STORAGE_SOP_CLASSES {
            policy = policy.with_abstract_syntax(*sop_class);
        }
        capabilities = capabilities.with_c_store(StoreToDirectory {
            out_dir: out_dir.clone(),
        });
        builder = builder.storage(TempFileStorage::in_dir(out_dir.clone()));
    }
    let builder = builder.options(options).capabilities(capabilities);

    let provider: Arc<dyn ServiceProvider> = if accept_any_called_ae_title {
        Arc::new(policy)
    } else {
        Arc::new(policy.accept_called_ae_title())
    };

    let listen_addr = SocketAddrV4::new(Ipv4Addr::from(0), port);
    let server = DicomServer::bind(listen_addr, builder)
        .await
        .whatever_context("Could not bind listener")?;
    info!("{} listening on: tcp://{}", &ae_title, listen_addr);

    server
        .run(move |_addr| Arc::clone(&provider))
        .await
        .whatever_context("Could not accept connection")
}

/// Storage SOP classes accepted with `--store`.
static STORAGE_SOP_CLASSES: &[&str] = &[
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::RT_IMAGE_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
];

#[cfg(test)]
mod tests {
    use super::App;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        App::command().debug_assert();
    }
}
