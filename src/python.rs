use std::path::PathBuf;

use parking_lot::Mutex;
use pyo3::exceptions::{PyKeyError, PyOSError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use crate::config::DbmConfig;
use crate::error::Error;
use crate::shm::{Dbm, OpenMode};

pyo3::create_exception!(shmdbm, DbmError, PyOSError);

impl From<Error> for PyErr {
    fn from(e: Error) -> PyErr {
        DbmError::new_err(e.to_string())
    }
}

/// Keys and values may be `bytes` or `str` (stored as UTF-8).
fn to_bytes(obj: &Bound<'_, PyAny>) -> PyResult<Vec<u8>> {
    if let Ok(s) = obj.extract::<String>() {
        return Ok(s.into_bytes());
    }
    obj.extract::<Vec<u8>>()
}

/// A dbm-style mapping backed by a shared memory-mapped file.
#[pyclass(frozen, name = "Ndbm", module = "shmdbm")]
pub struct PyNdbm {
    db: Mutex<Option<Dbm>>,
}

impl PyNdbm {
    fn with<T>(&self, f: impl FnOnce(&mut Dbm) -> crate::Result<T>) -> PyResult<T> {
        let mut guard = self.db.lock();
        match guard.as_mut() {
            Some(db) => Ok(f(db)?),
            None => Err(DbmError::new_err("DBM object has already been closed")),
        }
    }
}

#[pymethods]
impl PyNdbm {
    #[new]
    #[pyo3(signature = (path, flag="r", mode=0o666))]
    fn new(path: PathBuf, flag: &str, mode: u32) -> PyResult<Self> {
        let open_mode = OpenMode::from_flag(flag).ok_or_else(|| {
            PyValueError::new_err(format!("flag must be one of 'r', 'w', 'c' or 'n', not {flag:?}"))
        })?;
        let config = DbmConfig::from_env().with_file_mode(mode);
        let db = Dbm::open_with(&path, open_mode, config)?;
        Ok(PyNdbm {
            db: Mutex::new(Some(db)),
        })
    }

    fn __getitem__(&self, py: Python<'_>, key: &Bound<'_, PyAny>) -> PyResult<Py<PyBytes>> {
        let k = to_bytes(key)?;
        match self.with(|db| db.lookup(&k))? {
            Some(v) => Ok(PyBytes::new(py, &v).unbind()),
            None => Err(PyKeyError::new_err(key.clone().unbind())),
        }
    }

    fn __setitem__(&self, key: &Bound<'_, PyAny>, value: &Bound<'_, PyAny>) -> PyResult<()> {
        let (k, v) = (to_bytes(key)?, to_bytes(value)?);
        self.with(|db| db.store(&k, &v))?;
        Ok(())
    }

    fn __delitem__(&self, key: &Bound<'_, PyAny>) -> PyResult<()> {
        let k = to_bytes(key)?;
        if self.with(|db| db.delete(&k))? {
            Ok(())
        } else {
            Err(PyKeyError::new_err(key.clone().unbind()))
        }
    }

    fn __contains__(&self, key: &Bound<'_, PyAny>) -> PyResult<bool> {
        let k = to_bytes(key)?;
        self.with(|db| db.contains(&k))
    }

    fn __len__(&self) -> PyResult<usize> {
        Ok(self.with(|db| db.len())? as usize)
    }

    #[pyo3(signature = (key, default=None))]
    fn get(
        &self,
        py: Python<'_>,
        key: &Bound<'_, PyAny>,
        default: Option<Py<PyAny>>,
    ) -> PyResult<Py<PyAny>> {
        let k = to_bytes(key)?;
        match self.with(|db| db.lookup(&k))? {
            Some(v) => Ok(PyBytes::new(py, &v).into_any().unbind()),
            None => Ok(default.unwrap_or_else(|| py.None())),
        }
    }

    fn keys(&self, py: Python<'_>) -> PyResult<Vec<Py<PyBytes>>> {
        let keys = self.with(|db| db.keys())?;
        Ok(keys.iter().map(|k| PyBytes::new(py, k).unbind()).collect())
    }

    fn close(&self) -> PyResult<()> {
        if let Some(db) = self.db.lock().take() {
            db.close()?;
        }
        Ok(())
    }

    fn __enter__(slf: Py<Self>) -> Py<Self> {
        slf
    }

    #[pyo3(signature = (*_args))]
    fn __exit__(&self, _args: &Bound<'_, pyo3::types::PyTuple>) -> PyResult<bool> {
        self.close()?;
        Ok(false)
    }

    fn __repr__(&self) -> String {
        match self.db.lock().as_ref() {
            Some(db) => format!("<shmdbm.Ndbm {}>", db.path().display()),
            None => "<shmdbm.Ndbm (closed)>".to_string(),
        }
    }
}

/// `shmdbm.open(path, flag='r', mode=0o666)`, mirroring `dbm.ndbm.open`.
#[pyfunction]
#[pyo3(signature = (path, flag="r", mode=0o666))]
fn open(path: PathBuf, flag: &str, mode: u32) -> PyResult<PyNdbm> {
    PyNdbm::new(path, flag, mode)
}

#[pymodule]
pub fn shmdbm(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyNdbm>()?;
    m.add_function(wrap_pyfunction!(open, m)?)?;
    m.add("error", m.py().get_type::<DbmError>())?;
    Ok(())
}
