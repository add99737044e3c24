use ark::{Compiler, DEFAULT_FEATURES};
use codesnake::{Block, CodeWidth, Label, LineIndex};
use rustyline::{history::MemHistory, Config};
use yansi::Paint;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut readline =
        rustyline::Editor::<(), _>::with_history(Config::default(), MemHistory::new())?;

    while let Ok(input) = readline.readline(">> ") {
        let src = input.as_str();

        let mut compiler = Compiler::new(0, DEFAULT_FEATURES);
        let outcome = compiler
            .feed(src, "repl.ark")
            .and_then(|()| compiler.compile());

        match outcome {
            Ok(()) => {
                // show what the compiler produced
                let symbols: Vec<_> = compiler
                    .symbols()
                    .iter()
                    .filter_map(|sym| sym.string())
                    .collect();
                println!("symbols: {symbols:?}");
                println!("values:  {:?}", compiler.constants());
                if !compiler.plugins().is_empty() {
                    println!("plugins: {:?}", compiler.plugins());
                }
                for (id, page) in compiler.pages().iter().enumerate() {
                    println!("page {id}");
                    for (at, inst) in page.iter().enumerate() {
                        println!(
                            "  {:>3}  {} {} {}",
                            at,
                            format!("{:?}", inst.op).cyan(),
                            inst.arg,
                            inst.extra
                        );
                    }
                }
                println!("{} bytes of bytecode", compiler.bytecode().len());
            }
            Err(err) => {
                let idx = LineIndex::new(src);
                let block = Block::new(
                    &idx,
                    [Label::new(err.location().span.clone())
                        .with_text(err.to_string())
                        .with_style(|s| s.red().to_string())],
                );

                if let Some(block) = block.map(|blk| blk.map_code(|c| CodeWidth::new(c, c.len()))) {
                    println!("{}[repl.ark]", block.prologue());
                    print!("{block}");
                    println!("{}", block.epilogue());
                } else {
                    println!("{}", err.to_string().red());
                }
            }
        }

        readline.add_history_entry(input)?;
    }

    Ok(())
}
