//! Global error handling mechanisms.

/// Let tallyflow handle fatal errors in the process.
///
/// Fatal errors abort the replica they occur on. The job runner observes the abort,
/// cancels all other replicas and reports the job as failed; there is no partial-state
/// recovery.
pub trait TallyFatal<T, E>: Sized + sealed::Sealed {
    /// Abort the replica as gracefully as possible due to a fatal non-recoverable error.
    fn tally_fatal(self) -> T;
}

impl<T, E> TallyFatal<T, E> for Result<T, E>
where
    E: std::fmt::Debug + std::error::Error + Send + Sync + 'static,
{
    fn tally_fatal(self) -> T {
        match self {
            Ok(x) => x,
            Err(e) => {
                let report = eyre::Report::new(e);
                tracing::error!("Fatal error: {report:?}");
                panic!("{report:?}")
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

#[cfg(test)]
mod tests {
    use super::TallyFatal;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn passes_ok() {
        let res: Result<i32, Boom> = Ok(5);
        assert_eq!(res.tally_fatal(), 5);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panics_on_err() {
        let res: Result<i32, Boom> = Err(Boom);
        res.tally_fatal();
    }
}
