use comfy_table::presets::ASCII_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use phyloforge::candidates::CandidateRecord;
use phyloforge::checkpoint::CheckpointState;
use phyloforge::optimizer::TreeSearch;
use std::path::Path;
use std::time::Duration;

fn shorten(tree: &str, width: usize) -> String {
    if tree.chars().count() <= width {
        tree.to_string()
    } else {
        let head: String = tree.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn candidates_table(records: &[CandidateRecord], best: f64) -> Table {
    let mut table = Table::new();
    table
        .load_preset(ASCII_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.add_row(vec![
        Cell::new("#").add_attribute(Attribute::Bold),
        Cell::new("Score").fg(Color::Cyan),
        Cell::new("Delta"),
        Cell::new("Source"),
        Cell::new("Topology").add_attribute(Attribute::Bold),
    ]);
    for i in 0..=3 {
        if let Some(col) = table.column_mut(i) {
            col.set_cell_alignment(CellAlignment::Right);
        }
    }

    for (i, r) in records.iter().enumerate() {
        let delta = r.score - best;
        let delta_cell = if delta == 0.0 {
            Cell::new("0").fg(Color::Green)
        } else {
            Cell::new(format!("{:.4}", delta)).fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(format!("{:.4}", r.score)).fg(Color::Cyan),
            delta_cell,
            Cell::new(r.source),
            Cell::new(shorten(&r.tree, 60)),
        ]);
    }
    table
}

fn key_value_table(rows: Vec<(&str, String)>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(ASCII_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    for (key, value) in rows {
        table.add_row(vec![Cell::new(key).add_attribute(Attribute::Bold), Cell::new(value)]);
    }
    table
}

pub fn print_run_summary(search: &TreeSearch, treefile: &Path, elapsed: Duration, top: usize) {
    let ctx = search.context();
    let mut rows = vec![
        ("Taxa", ctx.leaf_count().to_string()),
        ("Processes", ctx.nprocs.to_string()),
        ("Iterations", search.iterations().to_string()),
        ("Stopped by", search.stop_reason().to_string()),
        ("Best score", format!("{:.4}", search.best_score())),
        ("Elapsed", format!("{:.1}s", elapsed.as_secs_f64())),
        ("Tree file", treefile.display().to_string()),
    ];
    if let Some(acc) = search.bootstrap() {
        rows.push(("Bootstrap replicates", acc.len().to_string()));
        rows.push(("Split support correlation", format!("{:.4}", acc.correlation())));
    }
    println!("\n{}", key_value_table(rows));

    let records: Vec<CandidateRecord> = search.candidates().iter().take(top).cloned().collect();
    println!("\n🏆 TOP {} CANDIDATE TREES", records.len());
    println!("{}", candidates_table(&records, search.best_score()));
}

pub fn print_checkpoint_summary(path: &Path, state: &CheckpointState, top: usize) {
    let best = state
        .candidates
        .iter()
        .map(|r| r.score)
        .fold(f64::MIN, f64::max);
    let mut rows = vec![
        ("File", path.display().to_string()),
        ("Run", state.fingerprint.clone()),
        ("Phase", state.phase.to_string()),
        ("Iteration", state.stop_rule.cur_it.to_string()),
        (
            "Last improvement",
            state
                .stop_rule
                .improved_iterations
                .last()
                .map_or_else(|| "-".to_string(), |it| it.to_string()),
        ),
        ("Candidates", state.candidates.len().to_string()),
        ("IQP deletions", state.iqp.k_delete.to_string()),
    ];
    if let Some(b) = &state.bootstrap {
        rows.push(("Bootstrap replicates", b.replicates.len().to_string()));
        rows.push(("Support snapshots", b.snapshots.len().to_string()));
    }
    println!("\n{}", key_value_table(rows));

    let mut records = state.candidates.clone();
    records.sort_by(|a, b| b.score.total_cmp(&a.score));
    records.truncate(top);
    if !records.is_empty() {
        println!("\n🏆 TOP {} CANDIDATE TREES", records.len());
        println!("{}", candidates_table(&records, best));
    }
}
