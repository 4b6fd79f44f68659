use crate::dag::FunctionDag;
use crate::loop_nest::LoopNest;

use prettytable::{self, format, row};
use std::fmt;

const INDENT_SIZE: usize = 2;

/// Pretty-print a loop nest to stdout.
pub fn pprint(dag: &FunctionDag, root: &LoopNest) {
    pprint_table(dag, root).printstd()
}

/// Pretty-print a loop nest to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(out: &mut W, dag: &FunctionDag, root: &LoopNest) -> fmt::Result {
    write!(out, "{}", pprint_table(dag, root))
}

pub fn pprint_string(dag: &FunctionDag, root: &LoopNest) -> String {
    format!("{}", pprint_table(dag, root))
}

fn indent(depth: usize) -> String {
    " ".repeat(depth * INDENT_SIZE)
}

fn pprint_table(dag: &FunctionDag, root: &LoopNest) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    table.set_titles(row!["Loop", "Vector", "Flags"]);
    pprint_inner(&mut table, dag, root, None, 0);

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

fn pprint_inner(
    table: &mut prettytable::Table,
    dag: &FunctionDag,
    nest: &LoopNest,
    parent: Option<&LoopNest>,
    depth: usize,
) {
    let mut flags = vec![];
    if nest.tileable {
        flags.push("t");
    }
    if nest.innermost {
        flags.push("*");
    } else if nest.parallel {
        flags.push("p");
    }

    let mut inner_depth = depth;
    match (parent, nest.stage_key()) {
        (Some(parent), Some(key)) => {
            let bounds = parent.get_bounds(dag, key.node);
            let mut line = format!("{}{}", indent(depth), dag.stage(key).name);
            for (i, s) in nest.size.iter().enumerate() {
                line.push_str(&format!(" {s}"));
                if nest.innermost && nest.vectorized_loop_index == Some(i) {
                    line.push('v');
                }
                // Constant extents can be unrolled.
                if bounds.loops(key.stage, i).constant_extent() {
                    line.push('c');
                }
            }
            let vector = format!(
                "({}, {})",
                fmt_index(nest.vectorized_loop_index),
                fmt_index(nest.vector_dim)
            );
            table.add_row(row![line, vector, flags.join(" ")]);
            inner_depth += 1;
        }
        _ => {
            table.add_row(row![format!("{}root", indent(depth)), "", flags.join(" ")]);
        }
    }

    let prefix = indent(inner_depth);
    for &f in &nest.store_at {
        table.add_row(row![format!("{prefix}realize: {}", dag.nodes[f].name), "", ""]);
    }
    for c in nest.children.iter().rev() {
        pprint_inner(table, dag, c, Some(nest), inner_depth);
    }
    for (&f, calls) in &nest.inlined {
        table.add_row(row![
            format!("{prefix}inlined: {} {calls}", dag.nodes[f].name),
            "",
            ""
        ]);
    }
}

fn fmt_index(i: Option<usize>) -> String {
    i.map_or_else(|| "-".to_owned(), |i| i.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MachineParams;
    use crate::pipelines;

    #[test]
    fn test_pprint_marks_vectorized_loop() {
        let dag = pipelines::blur(64, 64);
        let params = MachineParams::default();
        let root = LoopNest::default().compute_in_tiles(&dag, 0, None, &params, 0, false)[0].clone();
        let s = pprint_string(&dag, &root);
        assert!(s.contains("realize: output"), "{s}");
        assert!(s.contains("output 8v"), "{s}");
        assert!(s.contains('*'), "{s}");
    }

    #[test]
    fn test_pprint_lists_inlined_funcs() {
        let dag = pipelines::blur(64, 64);
        let params = MachineParams::default();
        let mut root = (*LoopNest::default().compute_in_tiles(&dag, 0, None, &params, 0, false)[0]).clone();
        let blur_x = dag.node_by_name("blur_x").unwrap().id;
        root.inline_func(&dag, blur_x);
        let mut s = String::new();
        pprint_write(&mut s, &dag, &root).unwrap();
        assert!(s.contains("inlined: blur_x 3"), "{s}");
    }
}
