//! Reference index backed by an in-RAM tantivy index.
//!
//! Every reference column becomes one text field, tokenized by the
//! [`Analyzer`] chosen for it (columns that are only used as filters are
//! indexed as words). A query is a tantivy `BooleanQuery`: each query token
//! is a `Should` clause with a constant score, `must` terms are zero-scored
//! `Must` clauses and `must_not` terms are `MustNot` clauses.

use super::{Analyzer, Candidate, IndexedField, Indexer, Query};
use crate::table::Table;
use anyhow::Context;
use std::collections::{BTreeSet, HashMap};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, ConstScoreQuery, Occur, Query as TantivyQuery, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED};
use tantivy::tokenizer::{LowerCaser, NgramTokenizer, RawTokenizer, SimpleTokenizer, TextAnalyzer, TokenStream};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::debug;

const WORDS_TOKENIZER: &str = "mergeflow_words";
const TRIGRAMS_TOKENIZER: &str = "mergeflow_trigrams";
const EXACT_TOKENIZER: &str = "mergeflow_exact";

/// Single writer thread; the reference is indexed once per link
const WRITER_HEAP_BYTES: usize = 20_000_000;

const ROW_FIELD: &str = "row";

impl Analyzer {
    fn tokenizer_name(self) -> &'static str {
        match self {
            Analyzer::Words => WORDS_TOKENIZER,
            Analyzer::Trigrams => TRIGRAMS_TOKENIZER,
            Analyzer::Exact => EXACT_TOKENIZER,
        }
    }
}

/// Inverted index of a reference table.
///
/// A `should` clause scores the share of its query tokens, weighted by
/// inverse document frequency, found in the candidate's field. A row's
/// score is the mean over clauses, so it lies in `[0, 1]`.
#[derive(Default)]
pub struct TantivyIndex {
    state: Option<IndexedReference>,
}

struct IndexedReference {
    index: Index,
    reader: IndexReader,
    row: Field,
    fields: HashMap<String, Field>,
}

fn register_tokenizers(index: &Index) -> anyhow::Result<()> {
    let tokenizers = index.tokenizers();
    tokenizers.register(
        WORDS_TOKENIZER,
        TextAnalyzer::builder(SimpleTokenizer::default()).filter(LowerCaser).build(),
    );
    tokenizers.register(
        TRIGRAMS_TOKENIZER,
        TextAnalyzer::builder(NgramTokenizer::new(3, 3, false)?)
            .filter(LowerCaser)
            .build(),
    );
    tokenizers.register(
        EXACT_TOKENIZER,
        TextAnalyzer::builder(RawTokenizer::default()).filter(LowerCaser).build(),
    );
    Ok(())
}

fn text_options(analyzer: Analyzer) -> TextOptions {
    TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(analyzer.tokenizer_name())
            .set_index_option(IndexRecordOption::WithFreqs),
    )
}

impl Indexer for TantivyIndex {
    fn index(&mut self, table: &Table, fields: &[IndexedField]) -> anyhow::Result<()> {
        for field in fields {
            if table.column_index(&field.column).is_none() {
                anyhow::bail!("reference has no column '{}'", field.column);
            }
        }

        // Field names are positional; column names are free text
        let mut builder = Schema::builder();
        let row = builder.add_u64_field(ROW_FIELD, STORED);
        let mut by_column = HashMap::new();
        let mut columns = Vec::with_capacity(table.columns.len());
        for (idx, column) in table.columns.iter().enumerate() {
            let analyzer = fields
                .iter()
                .find(|f| &f.column == column)
                .map(|f| f.analyzer)
                .unwrap_or(Analyzer::Words);
            let field = builder.add_text_field(&format!("c{}", idx), text_options(analyzer));
            by_column.insert(column.clone(), field);
            columns.push(field);
        }

        let index = Index::create_in_ram(builder.build());
        register_tokenizers(&index)?;
        let mut writer: IndexWriter = index
            .writer_with_num_threads(1, WRITER_HEAP_BYTES)
            .context("Failed to create index writer")?;
        for (row_idx, values) in table.rows.iter().enumerate() {
            let mut document = TantivyDocument::default();
            document.add_u64(row, row_idx as u64);
            for (field, value) in columns.iter().zip(values) {
                let value = value.trim();
                if !value.is_empty() {
                    document.add_text(*field, value);
                }
            }
            writer.add_document(document)?;
        }
        writer.commit().context("Failed to commit reference index")?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .context("Failed to open index reader")?;
        debug!("Indexed {} reference rows on {} fields", table.len(), fields.len());
        self.state = Some(IndexedReference {
            index,
            reader,
            row,
            fields: by_column,
        });
        Ok(())
    }

    fn query(&self, query: &Query) -> anyhow::Result<Vec<Candidate>> {
        let state = self.state.as_ref().context("query before the reference was indexed")?;
        if query.should.is_empty() || query.size == 0 {
            return Ok(Vec::new());
        }
        let searcher = state.reader.searcher();
        let num_docs = searcher.num_docs();
        let clauses = query.should.len() as f64;

        let mut subqueries: Vec<(Occur, Box<dyn TantivyQuery>)> = Vec::new();
        for (column, text) in &query.should {
            let field = state.field(column)?;
            let terms: Vec<Term> = state
                .tokens(field, text)?
                .into_iter()
                .map(|token| Term::from_field_text(field, &token))
                .collect();
            let weights = terms
                .iter()
                .map(|term| Ok(idf(searcher.doc_freq(term)?, num_docs)))
                .collect::<anyhow::Result<Vec<f64>>>()?;
            let total: f64 = weights.iter().sum();
            if total <= 0.0 {
                continue;
            }
            for (term, weight) in terms.into_iter().zip(weights) {
                let score = (weight / total / clauses) as f32;
                subqueries.push((Occur::Should, constant(term_query(term), score)));
            }
        }
        if subqueries.is_empty() {
            return Ok(Vec::new());
        }
        for (column, text) in &query.must {
            if let Some(all) = state.all_tokens(column, text)? {
                subqueries.push((Occur::Must, constant(all, 0.0)));
            }
        }
        for (column, text) in &query.must_not {
            if let Some(all) = state.all_tokens(column, text)? {
                subqueries.push((Occur::MustNot, all));
            }
        }

        let boolean = BooleanQuery::new(subqueries);
        let top = searcher.search(&boolean, &TopDocs::with_limit(query.size))?;
        let mut candidates = Vec::with_capacity(top.len());
        for (score, address) in top {
            if score <= 0.0 {
                continue;
            }
            let document: TantivyDocument = searcher.doc(address)?;
            let row = document
                .get_first(state.row)
                .and_then(|v| v.as_u64())
                .context("indexed document has no row number")?;
            candidates.push(Candidate {
                row: row as usize,
                score: f64::from(score),
            });
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.row.cmp(&b.row)));
        Ok(candidates)
    }
}

impl IndexedReference {
    fn field(&self, column: &str) -> anyhow::Result<Field> {
        self.fields
            .get(column)
            .copied()
            .with_context(|| format!("column '{}' is not indexed", column))
    }

    /// Distinct tokens of `text` as the field's analyzer produces them
    fn tokens(&self, field: Field, text: &str) -> anyhow::Result<BTreeSet<String>> {
        let mut analyzer = self.index.tokenizer_for_field(field)?;
        let mut stream = analyzer.token_stream(text.trim());
        let mut tokens = BTreeSet::new();
        while stream.advance() {
            tokens.insert(stream.token().text.clone());
        }
        Ok(tokens)
    }

    /// Matches documents holding every token of `text` in `column`
    fn all_tokens(&self, column: &str, text: &str) -> anyhow::Result<Option<Box<dyn TantivyQuery>>> {
        let field = self.field(column)?;
        let clauses: Vec<(Occur, Box<dyn TantivyQuery>)> = self
            .tokens(field, text)?
            .into_iter()
            .map(|token| (Occur::Must, term_query(Term::from_field_text(field, &token))))
            .collect();
        if clauses.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(BooleanQuery::new(clauses))))
    }
}

fn idf(doc_freq: u64, num_docs: u64) -> f64 {
    (1.0 + num_docs as f64 / (1.0 + doc_freq as f64)).ln()
}

fn term_query(term: Term) -> Box<dyn TantivyQuery> {
    Box::new(TermQuery::new(term, IndexRecordOption::Basic))
}

fn constant(query: Box<dyn TantivyQuery>, score: f32) -> Box<dyn TantivyQuery> {
    Box::new(ConstScoreQuery::new(query, score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> Table {
        Table::new(
            vec!["name".into(), "city".into()],
            vec![
                vec!["Hopital Saint Louis".into(), "Paris".into()],
                vec!["Hopital Edouard Herriot".into(), "Lyon".into()],
                vec!["Clinique Saint Jean".into(), "Lyon".into()],
            ],
        )
    }

    fn index(analyzer: Analyzer) -> TantivyIndex {
        let mut index = TantivyIndex::default();
        index
            .index(
                &reference(),
                &[IndexedField {
                    column: "name".into(),
                    analyzer,
                }],
            )
            .unwrap();
        index
    }

    fn tokens(analyzer: Analyzer, text: &str) -> Vec<String> {
        let index = index(analyzer);
        let state = index.state.as_ref().unwrap();
        state.tokens(state.field("name").unwrap(), text).unwrap().into_iter().collect()
    }

    #[test]
    fn test_analyzers() {
        assert_eq!(tokens(Analyzer::Words, " Saint-Louis "), vec!["louis", "saint"]);
        assert_eq!(tokens(Analyzer::Trigrams, "Louis"), vec!["lou", "oui", "uis"]);
        assert_eq!(tokens(Analyzer::Exact, " Saint Louis "), vec!["saint louis"]);
    }

    #[test]
    fn test_query_ranks_best_match_first() {
        let index = index(Analyzer::Words);
        let query = Query {
            should: vec![("name".into(), "hopital saint louis".into())],
            size: 10,
            ..Query::default()
        };
        let candidates = index.query(&query).unwrap();
        assert_eq!(candidates[0].row, 0);
        assert!((candidates[0].score - 1.0).abs() < 1e-5);
        assert!(candidates.iter().all(|c| c.score <= 1.0 + 1e-5));
        assert_eq!(candidates.len(), 3);
    }

    #[test]
    fn test_typos_still_match_with_trigrams() {
        let index = index(Analyzer::Trigrams);
        let query = Query {
            should: vec![("name".into(), "hopitl edouard heriot".into())],
            size: 1,
            ..Query::default()
        };
        assert_eq!(index.query(&query).unwrap()[0].row, 1);
    }

    #[test]
    fn test_filters() {
        let index = index(Analyzer::Words);
        let query = Query {
            should: vec![("name".into(), "saint".into())],
            must_not: vec![("city".into(), "paris".into())],
            size: 10,
            ..Query::default()
        };
        let rows: Vec<usize> = index.query(&query).unwrap().into_iter().map(|c| c.row).collect();
        assert_eq!(rows, vec![2]);

        let query = Query {
            should: vec![("name".into(), "hopital".into())],
            must: vec![("city".into(), "Lyon".into())],
            size: 10,
            ..Query::default()
        };
        let rows: Vec<usize> = index.query(&query).unwrap().into_iter().map(|c| c.row).collect();
        assert_eq!(rows, vec![1]);
    }

    #[test]
    fn test_must_filters_do_not_change_scores() {
        let index = index(Analyzer::Words);
        let plain = Query {
            should: vec![("name".into(), "hopital".into())],
            size: 10,
            ..Query::default()
        };
        let filtered = Query {
            must: vec![("city".into(), "lyon".into())],
            ..plain.clone()
        };
        let plain = index.query(&plain).unwrap();
        let filtered = index.query(&filtered).unwrap();
        let unfiltered_score = plain.iter().find(|c| c.row == 1).map(|c| c.score);
        assert_eq!(unfiltered_score, Some(filtered[0].score));
    }

    #[test]
    fn test_unknown_column_and_unindexed_reference() {
        let index = index(Analyzer::Words);
        let query = Query {
            should: vec![("population".into(), "paris".into())],
            size: 1,
            ..Query::default()
        };
        assert!(index.query(&query).is_err());
        assert!(TantivyIndex::default().query(&query).is_err());

        let mut missing = TantivyIndex::default();
        let fields = [IndexedField {
            column: "population".into(),
            analyzer: Analyzer::Words,
        }];
        assert!(missing.index(&reference(), &fields).is_err());
    }
}
