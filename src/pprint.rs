use crate::common::CtxId;
use crate::taskdef::{FftsPlusCtxDef, FftsPlusTaskDef};

use itertools::Itertools;
use prettytable::{self, format, row, Cell, Row};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum TaskPrintStyle {
    Full,
    Compact,
}

/// Pretty-print a [FftsPlusTaskDef] to stdout.
pub fn pprint(task_def: &FftsPlusTaskDef, style: TaskPrintStyle) {
    pprint_table(task_def, style).printstd()
}

/// Pretty-print a [FftsPlusTaskDef] to a given [fmt::Write].
pub fn pprint_write<W: fmt::Write>(
    out: &mut W,
    task_def: &FftsPlusTaskDef,
    style: TaskPrintStyle,
) -> fmt::Result {
    write!(out, "{}", pprint_table(task_def, style))
}

pub fn pprint_string(task_def: &FftsPlusTaskDef, style: TaskPrintStyle) -> String {
    format!("{}", pprint_table(task_def, style))
}

fn pprint_table(task_def: &FftsPlusTaskDef, style: TaskPrintStyle) -> prettytable::Table {
    let mut table = prettytable::Table::new();
    let titles = match style {
        TaskPrintStyle::Full => row![
            "Ctx",
            "Type",
            "Thread",
            "Counters",
            "Address",
            "Prefetch",
            "Successors"
        ],
        TaskPrintStyle::Compact => row!["Ctx", "Type", "Successors"],
    };
    table.set_titles(titles);

    for (id, ctx) in task_def.iter() {
        let mut r = Row::new(vec![
            Cell::new(&id.to_string()),
            Cell::new(&ctx.ctx_type().to_string()),
        ]);
        if style == TaskPrintStyle::Full {
            r.add_cell(Cell::new(&format!(
                "{}/{}",
                ctx.thread_id(),
                ctx.thread_dim()
            )));
            match ctx {
                FftsPlusCtxDef::Compute(compute) => {
                    r.add_cell(Cell::new(&format!(
                        "pred {}/{}",
                        compute.pred_cnt, compute.pred_cnt_init
                    )));
                    r.add_cell(Cell::new(&compute.node.to_string()));
                    r.add_cell(Cell::new(&format!(
                        "{:04b} {}",
                        compute.prefetch_enable_bitmap,
                        join_ids(&compute.src_slot)
                    )));
                }
                FftsPlusCtxDef::Data(data) => {
                    r.add_cell(Cell::new(&format!("{}/{}", data.cnt, data.cnt_init)));
                    r.add_cell(Cell::new(&format!(
                        "{:#x}+{:#x}",
                        data.addr_base, data.addr_offset
                    )));
                    r.add_cell(Cell::new(""));
                }
            }
        }
        r.add_cell(Cell::new(&join_ids(ctx.successors())));
        table.add_row(r);
    }

    table.set_format(
        format::FormatBuilder::new()
            .separator(
                format::LinePosition::Title,
                format::LineSeparator::new('-', ' ', ' ', ' '),
            )
            .column_separator(' ')
            .build(),
    );
    table
}

fn join_ids(ids: &[CtxId]) -> String {
    ids.iter().join(", ")
}
