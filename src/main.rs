//! rforge – render a template with JSON data into a PDF.
//!
//! Usage:
//!   rforge <template> <data.json> [output.pdf] [--header-footer] [--landscape]
//!          [--templates DIR] [--config FILE] [--options FILE] [--timeout SECS] [--html]
//!
//! If `output.pdf` is omitted the PDF is written to the current directory
//! with the template's stem (e.g. `invoice-template.html` → `invoice-template.pdf`).

use std::{
    env, fs,
    path::{Path, PathBuf},
    process,
};

use tokio_util::sync::CancellationToken;

use report_forge::{ForgeConfig, ForgeError, RenderOptions, ReportForge, Value};

const EXIT_FAILURE: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;

struct Args {
    template: String,
    data: PathBuf,
    output: Option<PathBuf>,
    header_footer: bool,
    landscape: bool,
    template_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    options: Option<PathBuf>,
    timeout_secs: Option<u64>,
    html_only: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let argv: Vec<String> = env::args().collect();
    let args = parse_args(&argv);

    let mut config = match &args.config {
        Some(path) => ForgeConfig::load(path),
        None => ForgeConfig::from_env(),
    }
    .unwrap_or_else(|e| fail(&e));
    if let Some(dir) = args.template_dir.clone() {
        config.template_dir = Some(dir);
    }
    if let Some(secs) = args.timeout_secs {
        config.render_timeout_secs = secs;
    }

    let mut options = match &args.options {
        Some(path) => fs::read_to_string(path)
            .map_err(ForgeError::from)
            .and_then(|json| RenderOptions::from_json(&json))
            .unwrap_or_else(|e| fail(&e)),
        None => RenderOptions::default(),
    };
    if args.header_footer {
        options.header_footer = true;
    }
    if args.landscape {
        options.landscape = true;
    }

    let data = fs::read_to_string(&args.data)
        .map_err(|e| ForgeError::Config(format!("cannot read '{}': {e}", args.data.display())))
        .and_then(|json| Value::from_json_str(&json))
        .unwrap_or_else(|e| fail(&e));

    let forge = ReportForge::new(&config).unwrap_or_else(|e| fail(&e));

    if args.html_only {
        match forge.render_html(&args.template, &data) {
            Ok(html) => {
                write_output(&output_path(&args, "html"), html.as_bytes());
                return;
            }
            Err(e) => fail(&e),
        }
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; cleaning up…");
            interrupt.cancel();
        }
    });

    let result = forge
        .generate_report_with_cancel(&args.template, &data, &options, &cancel)
        .await;
    forge.shutdown().await;

    match result {
        Ok(bytes) => {
            let output = output_path(&args, "pdf");
            write_output(&output, &bytes);
            let pages = report_forge::inspect::inspect(&bytes)
                .map(|s| s.page_count)
                .unwrap_or(0);
            eprintln!(
                "Wrote '{}' ({} bytes, {} page{})",
                output.display(),
                bytes.len(),
                pages,
                if pages == 1 { "" } else { "s" }
            );
        }
        Err(ForgeError::Cancelled) => {
            eprintln!("Cancelled.");
            process::exit(EXIT_INTERRUPTED);
        }
        Err(e) => fail(&e),
    }
}

fn parse_args(argv: &[String]) -> Args {
    let prog = argv.first().map(String::as_str).unwrap_or("rforge");
    let mut positional: Vec<String> = Vec::new();
    let mut args = Args {
        template: String::new(),
        data: PathBuf::new(),
        output: None,
        header_footer: false,
        landscape: false,
        template_dir: None,
        config: None,
        options: None,
        timeout_secs: None,
        html_only: false,
    };

    let mut iter = argv.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--header-footer" | "-f" => args.header_footer = true,
            "--landscape" | "-l" => args.landscape = true,
            "--html" => args.html_only = true,
            "--templates" | "-t" => args.template_dir = Some(PathBuf::from(value_of(prog, arg, iter.next()))),
            "--config" | "-c" => args.config = Some(PathBuf::from(value_of(prog, arg, iter.next()))),
            "--options" | "-o" => args.options = Some(PathBuf::from(value_of(prog, arg, iter.next()))),
            "--timeout" => {
                let raw = value_of(prog, arg, iter.next());
                match raw.parse::<u64>() {
                    Ok(secs) if secs > 0 => args.timeout_secs = Some(secs),
                    _ => {
                        eprintln!("Error: --timeout expects a positive number of seconds, got '{raw}'");
                        process::exit(EXIT_FAILURE);
                    }
                }
            }
            "--help" | "-h" => {
                print_usage(prog);
                process::exit(0);
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown flag: {other}");
                print_usage(prog);
                process::exit(EXIT_FAILURE);
            }
            value => positional.push(value.to_string()),
        }
    }

    let mut positional = positional.into_iter();
    match (positional.next(), positional.next()) {
        (Some(template), Some(data)) => {
            args.template = template;
            args.data = PathBuf::from(data);
        }
        _ => {
            eprintln!("Error: a template name and a data file are required.");
            print_usage(prog);
            process::exit(EXIT_FAILURE);
        }
    }
    args.output = positional.next().map(PathBuf::from);
    if let Some(extra) = positional.next() {
        eprintln!("Unexpected argument: {extra}");
        print_usage(prog);
        process::exit(EXIT_FAILURE);
    }
    args
}

fn value_of<'a>(prog: &str, flag: &str, value: Option<&'a String>) -> &'a str {
    match value {
        Some(v) => v,
        None => {
            eprintln!("Error: {flag} needs a value.");
            print_usage(prog);
            process::exit(EXIT_FAILURE);
        }
    }
}

fn output_path(args: &Args, extension: &str) -> PathBuf {
    args.output.clone().unwrap_or_else(|| {
        let stem = PathBuf::from(&args.template)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("report")
            .to_string();
        PathBuf::from(stem).with_extension(extension)
    })
}

fn write_output(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!("Error creating output directory: {e}");
                process::exit(EXIT_FAILURE);
            }
        }
    }
    if let Err(e) = fs::write(path, bytes) {
        eprintln!("Error writing '{}': {e}", path.display());
        process::exit(EXIT_FAILURE);
    }
}

fn fail(err: &ForgeError) -> ! {
    eprintln!("Error: {err}");
    process::exit(EXIT_FAILURE);
}

fn print_usage(prog: &str) {
    eprintln!("rforge – render a template with JSON data into a PDF (report-forge)");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {prog} <template> <data.json> [output.pdf] [flags]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <template>     Template name, e.g. invoice-template.html");
    eprintln!("  <data.json>    Payload; {{\"$date\": …}} and {{\"$decimal\": …}} mark typed values");
    eprintln!("  [output.pdf]   Output path  (default: template stem with .pdf)");
    eprintln!();
    eprintln!("Flags:");
    eprintln!("  --header-footer, -f  Add running header/footer with page numbers");
    eprintln!("  --landscape, -l      Landscape orientation");
    eprintln!("  --templates, -t DIR  Read templates from DIR (default: bundled samples)");
    eprintln!("  --config, -c FILE    JSON configuration file");
    eprintln!("  --options, -o FILE   JSON render options (paper, margins, header/footer)");
    eprintln!("  --timeout SECS       Whole-report time limit");
    eprintln!("  --html               Write the expanded HTML instead of a PDF");
    eprintln!("  --help               Print this message");
    eprintln!();
    eprintln!("Environment: CHROME_PATH, FORGE_TEMPLATE_DIR, FORGE_MAX_CONCURRENCY,");
    eprintln!("FORGE_RENDER_TIMEOUT_SECS, RUST_LOG");
}
