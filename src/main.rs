use std::path::PathBuf;

use clap::Parser as ClapParser;
use colored::Colorize;

use crate::{
    backend::{
        codegen::CodeGen,
        ir::print::print_module,
        link::{assemble_to_object, link_executable, run_executable},
        x86_64::translate_module,
    },
    diagnostics::{emit_all, Diagnostic, Stage},
    frontend::{
        ast::Stmt,
        lexer::{Lexer, Token, TokenKind},
        parser::Parser,
        SourceFile, SourceFileOrigin,
    },
    middle::{
        builder::SymbolTableBuilder,
        operators::{Associativity, OpPosition},
        resolver::OperatorResolver,
        symbols::{Scope, ScopedSymbolTable, SymbolOrigin},
        type_check::TypeChecker,
    },
};

mod backend;
mod diagnostics;
mod frontend;
mod index;
mod middle;

#[derive(Debug, ClapParser)]
#[command(name = "brook", version, about = "Compiler for the Brook language")]
struct Args {
    /// Input source file
    input: PathBuf,

    /// Run the lexer only and print tokens
    #[arg(long)]
    lex: bool,
    /// Run the parser only and print the flat AST (no semantic analysis)
    #[arg(long)]
    parse: bool,
    /// Print the IR textual form to stdout
    #[arg(long = "emit-ir")]
    emit_ir: bool,
    /// Compile to an object file without linking
    #[arg(long)]
    compile: bool,
    /// Compile, link, and run the program
    #[arg(long)]
    run: bool,

    /// Print the resolved AST after semantic analysis
    #[arg(long = "dump-ast")]
    dump_ast: bool,
    /// Print the hierarchical symbol table
    #[arg(long = "dump-symbols")]
    dump_symbols: bool,
    /// Omit prelude symbols from symbol table output
    #[arg(long = "hide-prelude")]
    hide_prelude: bool,

    /// Output filename
    #[arg(short = 'o')]
    output: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    std::process::exit(drive(&args));
}

/// Runs the pipeline according to the mode flags. Exit codes: 0 on success,
/// 1 on any reported compilation error, 2 for system failures (unreadable
/// input, missing or failing toolchain).
fn drive(args: &Args) -> i32 {
    let contents = match std::fs::read_to_string(&args.input) {
        Ok(contents) => contents,
        Err(error) => {
            eprintln!("cannot open file '{}': {error}", args.input.display());
            return 2;
        }
    };

    let source = SourceFile {
        contents,
        origin: SourceFileOrigin::File(args.input.clone()),
    };

    /* Lex */

    let tokens = Lexer::tokenize_all(&source);

    if args.lex {
        return print_tokens(&source, &tokens);
    }

    let lex_errors: Vec<Diagnostic> = tokens
        .iter()
        .filter(|token| token.kind == TokenKind::Error)
        .map(|token| {
            let mut diagnostic =
                Diagnostic::new(Stage::Lexer, token.text.clone(), token.location);
            diagnostic.error_offset = token.error_offset;
            diagnostic
        })
        .collect();
    if !lex_errors.is_empty() {
        emit_all(&lex_errors, &source);
        return 1;
    }

    /* Parse */

    let (mut stmts, parse_errors) = Parser::parse_program(tokens);

    if !parse_errors.is_empty() {
        emit_all(&parse_errors, &source);
        return 1;
    }

    if args.parse {
        println!("{}", "AST:".green().bold());
        print!("{}", dump_stmts(&stmts));
        return 0;
    }

    /* Symbol tables: prelude first, then user code */

    let mut symbols = ScopedSymbolTable::new();
    let mut builder = SymbolTableBuilder::new();

    if !builder.load_prelude(&mut symbols) {
        eprintln!("failed to load prelude");
        for error in builder.errors() {
            eprintln!("  {}", error.message);
        }
        return 2;
    }

    if !builder.collect(&stmts, &mut symbols) {
        emit_all(builder.errors(), &source);
        return 1;
    }

    /* Operator resolution */

    let resolve_errors = OperatorResolver::resolve_program(&mut stmts, &symbols);
    if !resolve_errors.is_empty() {
        emit_all(&resolve_errors, &source);
        return 1;
    }

    /* Type checking */

    let type_errors = TypeChecker::check_program(&mut stmts, &symbols);
    if !type_errors.is_empty() {
        emit_all(&type_errors, &source);
        return 1;
    }

    if args.dump_ast {
        println!("{}", "Resolved AST:".green().bold());
        print!("{}", dump_stmts(&stmts));
    }

    if args.dump_symbols {
        print_symbols(&symbols, args.hide_prelude);
    }

    /* Code generation and backend */

    if args.emit_ir || args.compile || args.run || (!args.dump_ast && !args.dump_symbols) {
        let module_name = args
            .input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".to_owned());

        let module = match CodeGen::generate(&stmts, &symbols, &module_name) {
            Ok(module) => module,
            Err(errors) => {
                emit_all(&errors, &source);
                return 1;
            }
        };

        if args.emit_ir {
            print!("{}", print_module(&module));
            return 0;
        }

        let asm = translate_module(&module);

        if args.compile {
            let object_path = args
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("{module_name}.o")));

            return match assemble_to_object(&asm, &object_path) {
                Ok(()) => {
                    println!(
                        "{} {}",
                        "Object file generated:".green().bold(),
                        object_path.display()
                    );
                    0
                }
                Err(error) => {
                    eprintln!("{error}");
                    2
                }
            };
        }

        let exe_path = args
            .output
            .clone()
            .unwrap_or_else(|| PathBuf::from(&module_name));

        if let Err(error) = link_executable(&asm, &exe_path) {
            eprintln!("{error}");
            return 2;
        }

        if args.run {
            let status = match run_executable(&exe_path) {
                Ok(status) => status,
                Err(error) => {
                    eprintln!("{error}");
                    return 2;
                }
            };

            if args.output.is_none() {
                let _ = std::fs::remove_file(&exe_path);
            }

            return status;
        }

        println!(
            "{} {}",
            "Executable generated:".green().bold(),
            exe_path.display()
        );
    }

    0
}

fn dump_stmts(stmts: &[Stmt]) -> String {
    let mut out = String::new();
    for stmt in stmts {
        stmt.dump(&mut out, 0);
    }
    out
}

/// `--lex`: token dump to stdout, lexer errors rendered as diagnostics.
fn print_tokens(source: &SourceFile, tokens: &[Token]) -> i32 {
    let mut had_error = false;

    for token in tokens {
        if token.kind == TokenKind::Error {
            had_error = true;
            let mut diagnostic =
                Diagnostic::new(Stage::Lexer, token.text.clone(), token.location);
            diagnostic.error_offset = token.error_offset;
            diagnostic.emit(source);
            continue;
        }

        print!("[{}] ", token.kind);
        if !token.text.is_empty() && token.kind != TokenKind::EndOfFile {
            print!("'{}'", token.text);
        }
        println!(
            " (line {}, col {})",
            token.location.line, token.location.column
        );
    }

    if had_error {
        1
    } else {
        0
    }
}

/// `--dump-symbols`: global functions and operators, then the scope tree.
fn print_symbols(symbols: &ScopedSymbolTable, hide_prelude: bool) {
    println!("{}", "\nHierarchical Symbol Table:".cyan().bold());

    println!("{}", "\nGlobal Functions:".green().bold());
    let mut printed_any = false;
    for name in symbols.function_names() {
        for signature in symbols.find_functions(name) {
            if hide_prelude && signature.origin == SymbolOrigin::Prelude {
                continue;
            }
            printed_any = true;

            let params = signature
                .param_types
                .iter()
                .map(|ty| ty.value())
                .collect::<Vec<_>>()
                .join(", ");
            print!("  {name}({params})");
            if let Some(return_type) = signature.return_type {
                print!(" : {return_type}");
            }
            if signature.is_declaration_only {
                print!(" [declaration]");
            }
            if signature.origin == SymbolOrigin::Prelude {
                print!(" {}", "[prelude]".blue());
            }
            println!();
        }
    }
    if !printed_any && !hide_prelude {
        println!("  (none)");
    }

    println!("{}", "\nOperators:".green().bold());
    printed_any = false;
    for info in symbols.all_operators() {
        if hide_prelude && info.origin == SymbolOrigin::Prelude {
            continue;
        }
        printed_any = true;

        let position = match info.position {
            OpPosition::Prefix => "prefix",
            OpPosition::Infix => "infix",
            OpPosition::Postfix => "postfix",
        };
        let params = info
            .signature
            .param_types
            .iter()
            .map(|ty| ty.value())
            .collect::<Vec<_>>()
            .join(", ");
        print!(
            "  {position} {}({params}) : {}",
            info.symbol, info.signature.return_type
        );
        if info.position == OpPosition::Infix {
            print!(" [prec {}", info.precedence);
            if info.assoc == Associativity::Right {
                print!(", assoc_right");
            }
            print!("]");
        }
        if info.origin == SymbolOrigin::Prelude {
            print!(" {}", "[prelude]".blue());
        }
        println!();
    }
    if !printed_any {
        println!("  (none)");
    }

    println!("{}", "\nScope Hierarchy:".green().bold());
    print_scope(symbols, symbols.root_scope(), 0, hide_prelude);
}

fn print_scope(symbols: &ScopedSymbolTable, scope: &Scope, indent: usize, hide_prelude: bool) {
    let pad = "  ".repeat(indent);

    let description = if scope.description.is_empty() {
        "global"
    } else {
        scope.description.as_str()
    };
    println!("{}", format!("{pad}Scope [{description}]:").yellow().bold());

    let mut printed_header = false;
    for binding in scope.local_variables() {
        if hide_prelude && binding.origin == SymbolOrigin::Prelude {
            continue;
        }

        if !printed_header {
            println!("{pad}  Variables:");
            printed_header = true;
        }

        print!("{pad}    {}", binding.name);
        if let Some(type_name) = binding.type_name {
            print!(" : {type_name}");
        }
        print!(" (line {})", binding.loc.line);
        if binding.origin == SymbolOrigin::Prelude {
            print!(" {}", "[prelude]".blue());
        }
        println!();
    }

    for child in &scope.children {
        print_scope(symbols, symbols.scope(*child), indent + 1, hide_prelude);
    }
}
