use clap::Parser;
use pallenec_middle::ir::Module;
use pallenec_middle::middle_end::pipeline::run_pipeline;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// JSON-encoded input Module, as produced by the front end.
    input_file: String,
    /// Where to write the JSON-encoded, pass-rewritten Module.
    output_file: String,
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn read(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("could not read the input file {path}")),
    )
    .expect("the input file does not contain valid utf-8 text")
}

pub fn main() {
    let args = Args::parse();
    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .init();

    let module: Module =
        serde_json::from_str(&read(&args.input_file)).expect("input file is not a valid Module");

    match run_pipeline(module) {
        Ok(outcome) => {
            let output = serde_json::to_string_pretty(&outcome.module)
                .expect("pass-rewritten Module should always serialize");
            std::fs::write(&args.output_file, output)
                .unwrap_or_else(|_| panic!("could not write {}", args.output_file));
        }
        Err(diagnostics) => {
            for d in &diagnostics {
                eprintln!("{d}");
            }
            std::process::exit(1);
        }
    }
}
