use ark::compiler::value::Constant;
use ark::Compiler;
use datatest_stable::Utf8Path;

#[derive(thiserror::Error, Debug)]
#[error("error(s) occured in compile datatest at {0}")]
pub struct DatatestError(Box<Utf8Path>);

/// A datatest file has three sections separated by `---` lines: the expected
/// symbol table (one name per line), the expected value table, and the source
/// to compile. `;` starts a comment outside of the source section.
fn read_datatest(test_contents: &str) -> (Vec<&str>, Vec<&str>, String) {
    let mut symbol_section = vec![];
    let mut value_section = vec![];
    let mut source = String::new();

    #[derive(PartialEq, Eq, Debug, Default)]
    enum Section {
        #[default]
        Symbols,
        Values,
        Source,
    }
    let mut section = Section::default();

    for line in test_contents.lines() {
        if line.trim_start().starts_with(';') && section != Section::Source {
            // comment
            continue;
        }

        match section {
            Section::Symbols => match line {
                s if s.trim_end() == "---" => {
                    section = Section::Values;
                }
                sl => {
                    if !sl.trim().is_empty() {
                        symbol_section.push(sl.trim());
                    }
                }
            },
            Section::Values => match line {
                s if s.trim_end() == "---" => {
                    section = Section::Source;
                }
                vl => {
                    if !vl.trim().is_empty() {
                        value_section.push(vl.trim());
                    }
                }
            },
            Section::Source => {
                if !source.is_empty() {
                    source.push('\n');
                }
                source.push_str(line);
            }
        }
    }

    (symbol_section, value_section, source)
}

fn render_constant(constant: &Constant) -> String {
    match constant {
        Constant::Number(n) => format!("number {n}"),
        Constant::String(s) => format!("string {s}"),
        Constant::PageRef(index) => format!("pageref {index}"),
    }
}

fn compile_test(path: &Utf8Path, contents: String) -> datatest_stable::Result<()> {
    let (expected_symbols, expected_values, source) = read_datatest(&contents);

    let mut compiler = Compiler::new(0, 0);
    compiler.feed(&source, path.as_str())?;
    compiler.compile()?;

    let symbols: Vec<&str> = compiler
        .symbols()
        .iter()
        .filter_map(|sym| sym.string())
        .collect();
    let sym_error = if symbols != expected_symbols {
        println!(
            "error in {path}: mismatched symbol table\n\nGot:\n{symbols:?}\n\nExpected:\n{expected_symbols:?}"
        );
        true
    } else {
        false
    };

    let values: Vec<String> = compiler.constants().iter().map(render_constant).collect();
    let val_error = if values != expected_values {
        println!(
            "error in {path}: mismatched value table\n\nGot:\n{values:?}\n\nExpected:\n{expected_values:?}"
        );
        true
    } else {
        false
    };

    if sym_error || val_error {
        Err(DatatestError(Box::from(path)))?
    } else {
        Ok(())
    }
}

datatest_stable::harness! {
    compile_test, "test_data", r".*\.arkd",
}
