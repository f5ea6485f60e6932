use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse an outline and print sections, structure report and learning path.
    Parse(ParseArgs),
    /// Generate one section of a course.
    Section(SectionArgs),
    /// Generate every section of a course.
    Course(CourseArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Engine {
    /// Template content only; never touches the network.
    Offline,
    /// Google Gemini `generateContent`, keys from `GEMINI_API_KEY[_1..9]`.
    Gemini,
}

#[derive(Debug, Args)]
pub struct ParseArgs {
    /// Outline text file, one section per line.
    #[arg(long)]
    pub outline: String,

    /// Course title used for coverage scoring.
    #[arg(long, default_value = "")]
    pub title: String,

    /// Total course duration for the learning path.
    #[arg(long, default_value_t = 60)]
    pub minutes: u32,

    /// Output JSON path (stdout when omitted).
    #[arg(long)]
    pub out: Option<String>,

    /// Overwrite output if it exists.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct GenerationArgs {
    /// Course file (YAML or JSON) with title, outline and course settings.
    #[arg(long)]
    pub course: String,

    /// Content engine.
    #[arg(long, value_enum, default_value_t = Engine::Gemini)]
    pub engine: Engine,

    /// Extra elements the script must include.
    #[arg(long)]
    pub extra: Option<String>,

    /// Minutes per section (defaults to an even share of the course duration).
    #[arg(long)]
    pub minutes: Option<u32>,

    /// Output JSON path (stdout when omitted).
    #[arg(long)]
    pub out: Option<String>,

    /// Overwrite output if it exists.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct SectionArgs {
    #[command(flatten)]
    pub generation: GenerationArgs,

    /// Zero-based section index in the parsed outline.
    #[arg(long)]
    pub index: usize,

    /// Also print the copyable text block to stderr.
    #[arg(long, default_value_t = false)]
    pub copy_text: bool,
}

#[derive(Debug, Args)]
pub struct CourseArgs {
    #[command(flatten)]
    pub generation: GenerationArgs,

    /// Delay between sections.
    #[arg(long, default_value_t = 1000)]
    pub pace_ms: u64,
}
