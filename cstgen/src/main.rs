use std::{
    env,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    process,
};

use getopts::Options;

use cstgen::{generate, render_warning, GenOptions};

const WARNING: &str = "[Warning]";
const ERROR: &str = "[Error]";

fn usage(prog: &str, msg: &str) -> ! {
    let path = Path::new(prog);
    let leaf = match path.file_name() {
        Some(m) => m.to_str().unwrap(),
        None => "cstgen",
    };
    if !msg.is_empty() {
        eprintln!("{}", msg);
    }
    eprintln!(
        "Usage: {} [-q] [-d] [-n] [-o <output.rs>] [--terms <terms.rs>] <grammar file>",
        leaf
    );
    process::exit(1);
}

fn read_file<P: AsRef<Path>>(path: P) -> String {
    let mut f = match File::open(&path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Can't open file {}: {}", path.as_ref().display(), e);
            process::exit(1);
        }
    };
    let mut s = String::new();
    f.read_to_string(&mut s).unwrap();
    s
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let prog = &args[0];
    let matches = match Options::new()
        .optflag("h", "help", "")
        .optflag("q", "quiet", "Don't print warnings")
        .optflag("d", "dump-state-graph", "Print the parser state graph")
        .optflag("n", "term-names", "Include term names in the parser module")
        .optopt("o", "output", "Where to write the parser module", "PATH")
        .optopt("t", "terms", "Where to write the terms module", "PATH")
        .parse(&args[1..])
    {
        Ok(m) => m,
        Err(f) => usage(prog, f.to_string().as_str()),
    };

    if matches.opt_present("h") || matches.free.len() != 1 {
        usage(prog, "");
    }
    let quiet = matches.opt_present("q");
    let grammar_path = &matches.free[0];
    let src = read_file(grammar_path);

    let opts = GenOptions {
        term_names: matches.opt_present("n"),
        dump_states: matches.opt_present("d"),
    };

    let mut warnings = Vec::new();
    let artifacts = match generate(&src, &opts, &mut |w| warnings.push(w)) {
        Ok(a) => a,
        Err(e) => {
            if !quiet {
                for w in &warnings {
                    eprintln!("{} {}", WARNING, render_warning(w, grammar_path, &src));
                }
            }
            eprintln!("{} {}", ERROR, e.render(grammar_path, &src));
            process::exit(1);
        }
    };
    if !quiet {
        for w in &warnings {
            eprintln!("{} {}", WARNING, render_warning(w, grammar_path, &src));
        }
    }

    if let Some(pp) = &artifacts.state_graph {
        println!("{}", pp);
    }

    let stem = Path::new(grammar_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("parser");
    let out_path = matches
        .opt_str("o")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}_parser.rs", stem)));
    let terms_path = matches
        .opt_str("t")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}_terms.rs", stem)));

    if let Err(e) = fs::write(&out_path, &artifacts.parser_module) {
        eprintln!("Can't write {}: {}", out_path.display(), e);
        process::exit(1);
    }
    if let Err(e) = fs::write(&terms_path, &artifacts.terms_module) {
        eprintln!("Can't write {}: {}", terms_path.display(), e);
        process::exit(1);
    }

    if !quiet {
        eprintln!(
            "{} states, {} terms, {} token group(s) -> {} + {}",
            artifacts.state_count,
            artifacts.term_count,
            artifacts.group_count,
            out_path.display(),
            terms_path.display()
        );
    }
}
