use std::path::PathBuf;

use clap::Parser;

use crate::trace::DEFAULT_SPLIT_NUMBER;

#[derive(Debug, Parser)]
#[command(
    name = "jportal-decode",
    version,
    about = r#"
jportal-decode reconstructs a Java-level execution trace from an Intel
Processor Trace capture of an instrumented JVM.

EXAMPLES:
    # Decode a capture in the current directory, writing out-thrd<tid> files:
    jportal-decode --class-path build/classes

    # Decode an explicit capture to a custom prefix:
    jportal-decode --trace-data run1.data --class-path build/classes --output-prefix run1
"#
)]
pub struct Opt {
    /// Path to the multiplexed AUXTRACE/JVMRUNTIME/perf-sideband capture.
    #[arg(long, default_value = "JPortalTrace.data")]
    pub trace_data: PathBuf,

    /// A directory to search for `.class` files, in order; repeatable.
    #[arg(long = "class-path", value_name = "DIR")]
    pub class_path: Vec<PathBuf>,

    /// Prefix for the per-thread output files (`<prefix>-thrd<tid>`).
    #[arg(long = "output-prefix", default_value = "out")]
    pub out_prefix: String,

    /// Number of PSBs per PT work item; smaller splits parallelize further
    /// at the cost of more boundary re-sync overhead.
    #[arg(long, default_value_t = DEFAULT_SPLIT_NUMBER)]
    pub split_number: usize,

    /// Worker threads for decoding PT work items in parallel; 0 lets rayon
    /// pick based on available parallelism.
    #[arg(long, default_value_t = 0)]
    pub jobs: usize,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::Opt;

    #[test]
    fn verify_cli() {
        Opt::command().debug_assert();
    }

    #[test]
    fn defaults_match_documented_behavior() {
        let opt = Opt::parse_from(["jportal-decode"]);
        assert_eq!(opt.trace_data.to_str().unwrap(), "JPortalTrace.data");
        assert_eq!(opt.out_prefix, "out");
        assert!(opt.class_path.is_empty());
        assert_eq!(opt.split_number, super::DEFAULT_SPLIT_NUMBER);
        assert_eq!(opt.jobs, 0);
        assert_eq!(opt.verbose, 0);
    }

    #[test]
    fn verbose_flag_is_repeatable() {
        let opt = Opt::parse_from(["jportal-decode", "-vv"]);
        assert_eq!(opt.verbose, 2);
    }

    #[test]
    fn class_path_is_repeatable() {
        let opt = Opt::parse_from(["jportal-decode", "--class-path", "a", "--class-path", "b"]);
        assert_eq!(opt.class_path.len(), 2);
    }
}
