use drainq::{RunReport, SearchMatch, SessionSummary, SubQueue};

fn run_line(run: &RunReport) -> String {
    let c = &run.counters;
    format!(
        "{}: {} checked, {} deleted, {} moved, {} matched, {} skipped in {:.1?} ({:.1} msg/s) - {}",
        run.sub_queue,
        c.checked,
        c.deleted,
        c.moved,
        c.matched,
        c.skipped,
        c.elapsed,
        c.throughput(),
        run.end
    )
}

/// Per sub-queue breakdown followed by the totals.
pub fn summary(summary: &SessionSummary) {
    for run in summary.runs() {
        println!("{}", run_line(run));
    }
    let t = summary.totals();
    println!(
        "total: {} checked, {} deleted, {} moved, {} matched, {} skipped in {:.1?}",
        t.checked,
        t.deleted,
        t.moved,
        t.matched,
        t.skipped,
        summary.elapsed()
    );
    if t.duplicated > 0 {
        println!(
            "warning: {} messages were sent but could not be deleted from the source and now exist in both queues",
            t.duplicated
        );
    }
}

pub fn search_match(found: &SearchMatch) -> String {
    let mut lines = vec![
        format!("MATCH #{} in {}", found.ordinal, found.source),
        format!("   MessageId            : {}", found.message_id),
        format!("   SequenceNumber       : {}", found.sequence_number),
        format!(
            "   Enqueued             : {}",
            found
                .enqueued_at
                .map_or_else(|| "N/A".to_string(), |at| at.to_rfc3339())
        ),
    ];
    if found.source == SubQueue::DeadLetter {
        let dead_letter = found.dead_letter.clone().unwrap_or_default();
        lines.push(format!(
            "   DeadLetter Reason    : {}",
            dead_letter.reason.as_deref().unwrap_or("N/A")
        ));
        lines.push(format!(
            "   DeadLetter Error     : {}",
            dead_letter.error_description.as_deref().unwrap_or("N/A")
        ));
    }
    lines.push(format!("   Body preview         : {}", found.preview));
    lines.join("\n")
}

/// Every match, then one line per sub-queue with its match count.
pub fn search(summary: &SessionSummary, pattern: &str) {
    for found in summary.matches() {
        println!("{}\n", search_match(found));
    }
    for run in summary.runs() {
        println!(
            "{}: {} matches found in {} messages",
            run.sub_queue, run.counters.matched, run.counters.checked
        );
    }
    let t = summary.totals();
    println!(
        "total: {} matches found in {} messages in {:.1?}",
        t.matched,
        t.checked,
        summary.elapsed()
    );
    if t.matched == 0 {
        println!("no messages contain \"{pattern}\"");
    }
}
