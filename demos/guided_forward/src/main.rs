use burn::backend::NdArray;
use burn::config::Config;
use burn::prelude::{Backend, Tensor};
use clap::Parser;
use guided_models::models::guided::{ClassGuidedUNetConfig, ImageClassifier};
use guided_models::models::resnet::ClassifyingResNetConfig;
use guided_models::models::unet::DenoisingUNetConfig;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const CLASSIFIER_CONFIG: &str = "classifier.json";
const UNET_CONFIG: &str = "unet.json";
const GUIDED_CONFIG: &str = "guided.json";

// $ guided_forward --batch-size=2
// $ guided_forward --write-configs=/tmp/guided
// $ guided_forward --unet-config=/tmp/guided/unet.json
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Batch size of the zero image batch.
    #[arg(short, long, default_value_t = 2)]
    batch_size: usize,

    /// `ClassifyingResNetConfig` json; defaults when absent.
    #[arg(long)]
    classifier_config: Option<PathBuf>,

    /// `DenoisingUNetConfig` json; defaults when absent.
    #[arg(long)]
    unet_config: Option<PathBuf>,

    /// `ClassGuidedUNetConfig` json; defaults when absent.
    #[arg(long)]
    guided_config: Option<PathBuf>,

    /// Write the effective configs to this directory, and exit.
    #[arg(long)]
    write_configs: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn setup_tracing(verbose: bool) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_or_default<C: Config>(
    path: Option<&Path>,
    default: C,
) -> anyhow::Result<C> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            C::load(path).map_err(|err| anyhow::anyhow!("{}: {err}", path.display()))
        }
        None => Ok(default),
    }
}

struct Configs {
    classifier: ClassifyingResNetConfig,
    unet: DenoisingUNetConfig,
    guided: ClassGuidedUNetConfig,
}

impl Configs {
    fn load(args: &Args) -> anyhow::Result<Self> {
        Ok(Self {
            classifier: load_or_default(
                args.classifier_config.as_deref(),
                ClassifyingResNetConfig::new(),
            )?,
            unet: load_or_default(args.unet_config.as_deref(), DenoisingUNetConfig::new())?,
            guided: load_or_default(args.guided_config.as_deref(), ClassGuidedUNetConfig::new())?,
        })
    }

    fn save(
        &self,
        dir: &Path,
    ) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        self.classifier.save(dir.join(CLASSIFIER_CONFIG))?;
        self.unet.save(dir.join(UNET_CONFIG))?;
        self.guided.save(dir.join(GUIDED_CONFIG))?;
        tracing::info!(dir = %dir.display(), "wrote configs");
        Ok(())
    }
}

fn run<B: Backend>(
    args: &Args,
    configs: Configs,
    device: &B::Device,
) -> anyhow::Result<()> {
    tracing::debug!(
        guided = %serde_json::to_string(&configs.guided)?,
        "guided config"
    );

    let classifier = configs.classifier.try_init::<B>(device)?;
    let unet = configs.unet.try_init::<B>(device)?;
    let model = configs.guided.try_init(classifier, unet, device)?;

    let [height, width] = configs.guided.input_resolution;
    let input: Tensor<B, 4> = Tensor::zeros(
        [args.batch_size, model.classifier().in_channels(), height, width],
        device,
    );
    tracing::info!(shape = ?input.dims(), "input");

    let logits = model.classifier().classify(input.clone());
    tracing::info!(shape = ?logits.dims(), "classifier logits");

    let conditioning = model.condition(input.clone());
    tracing::info!(shape = ?conditioning.dims(), "conditioning map");

    let output = model.forward(input);
    tracing::info!(shape = ?output.dims(), "unet output");

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing(args.verbose)?;

    let configs = Configs::load(&args)?;

    if let Some(dir) = &args.write_configs {
        return configs.save(dir);
    }

    type B = NdArray<f32>;
    let device = Default::default();
    run::<B>(&args, configs, &device)
}
